//! In-process stand-ins for the external services.

use crate::api::{ImageSynthesizer, Publisher, ScriptWriter, VideoMetadata, VoiceEngine};
use crate::artifact::{Artifact, ArtifactKind, ArtifactStore};
use crate::error::{Result, VideoError};
use crate::script::{Script, Segment};
use crate::video::{ClipComposer, ClipConcatenator};
use async_trait::async_trait;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub fn tiny_wav() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..80 {
            writer.write_sample((i * 100) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn sample_script(subject: &str, segment_count: usize) -> Script {
    Script {
        title: format!("{}の話", subject),
        description: format!("{}についての動画です。", subject),
        topic: format!("{}, 科学", subject),
        category: "22".into(),
        segments: (0..segment_count)
            .map(|i| {
                Segment::new(
                    i,
                    &format!("パート{}", i),
                    &format!("{}の{}番目の文です。", subject, i),
                    &format!("{} scene {}", subject, i),
                )
            })
            .collect(),
    }
}

/// Writes scripts for any subject except the ones listed as failing.
#[derive(Default)]
pub struct FakeWriter {
    pub failing_subjects: Vec<String>,
    pub ideas: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ScriptWriter for FakeWriter {
    async fn generate_script(&self, subject: &str, segment_count: usize) -> Result<Script> {
        self.calls.lock().unwrap().push(subject.to_string());
        if self.failing_subjects.iter().any(|s| s == subject) {
            return Err(VideoError::GenerationFormat("unparseable".into()));
        }
        Ok(sample_script(subject, segment_count))
    }

    async fn generate_ideas(&self, _meta_topic: &str, count: usize) -> Result<Vec<String>> {
        Ok(self.ideas.iter().take(count).cloned().collect())
    }
}

/// Returns a short WAV for every unit unless the unit mentions `silent_marker`.
pub struct FakeVoice {
    pub silent_marker: Option<String>,
}

#[async_trait]
impl VoiceEngine for FakeVoice {
    async fn synthesize_unit(&self, text: &str) -> Result<Vec<u8>> {
        match &self.silent_marker {
            Some(marker) if text.contains(marker.as_str()) => {
                Err(VideoError::SynthesisUnit("HTTP 500".into()))
            }
            _ => Ok(tiny_wav()),
        }
    }
}

/// Fails for prompts containing `failing_marker`.
pub struct FakeImages {
    pub failing_marker: Option<String>,
}

#[async_trait]
impl ImageSynthesizer for FakeImages {
    async fn synthesize(&self, prompt: &str) -> Result<Vec<u8>> {
        match &self.failing_marker {
            Some(marker) if prompt.contains(marker.as_str()) => {
                Err(VideoError::ImageSynthesis("HTTP 500".into()))
            }
            _ => Ok(format!("image:{}", prompt).into_bytes()),
        }
    }
}

/// Writes `clip:<segment>:<secs>:<audio|silent>` into the clip file.
#[derive(Default)]
pub struct FakeComposer {
    pub composed: Mutex<Vec<(usize, Duration, bool)>>,
}

#[async_trait]
impl ClipComposer for FakeComposer {
    async fn compose(
        &self,
        store: &ArtifactStore,
        segment: usize,
        _image: &Artifact,
        audio: Option<&Artifact>,
        _silence: Duration,
        clip_duration: Duration,
    ) -> Result<Artifact> {
        self.composed
            .lock()
            .unwrap()
            .push((segment, clip_duration, audio.is_some()));
        let body = format!(
            "clip:{}:{}:{}",
            segment,
            clip_duration.as_secs(),
            if audio.is_some() { "audio" } else { "silent" }
        );
        store
            .write(ArtifactKind::Clip, Some(segment), "mp4", body.as_bytes())
            .await
    }
}

/// Joins clip files line by line.
pub struct FakeConcatenator;

#[async_trait]
impl ClipConcatenator for FakeConcatenator {
    async fn concatenate(&self, store: &ArtifactStore, clips: &[Artifact]) -> Result<Artifact> {
        let mut lines = Vec::new();
        for clip in clips {
            lines.push(tokio::fs::read_to_string(&clip.path).await?);
        }
        store
            .write(ArtifactKind::CombinedVideo, None, "mp4", lines.join("\n").as_bytes())
            .await
    }
}

/// Records uploads; fails when `fail` is set.
#[derive(Default)]
pub struct FakePublisher {
    pub fail: bool,
    pub uploads: Mutex<Vec<(PathBuf, VideoMetadata)>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, video: &Path, metadata: &VideoMetadata) -> Result<String> {
        if self.fail {
            return Err(VideoError::Transfer("HTTP 403: quota exceeded".into()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((video.to_path_buf(), metadata.clone()));
        Ok(format!("video-{}", uploads.len()))
    }
}

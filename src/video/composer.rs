use super::ffmpeg::Ffmpeg;
use super::ClipComposer;
use crate::artifact::{Artifact, ArtifactKind, ArtifactStore};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Builds one clip per segment: a still image over narration padded with silence.
pub struct FfmpegComposer {
    ffmpeg: Ffmpeg,
}

impl FfmpegComposer {
    pub fn new(ffmpeg: Ffmpeg) -> Self {
        Self { ffmpeg }
    }

    /// Builds the audio track for a clip and returns the scratch files it used.
    async fn soundtrack(
        &self,
        store: &ArtifactStore,
        segment: usize,
        audio: Option<&Artifact>,
        silence: Duration,
        clip_duration: Duration,
        scratch: &mut Vec<Artifact>,
    ) -> Result<Artifact> {
        match audio {
            Some(audio) => {
                let pad = store.reserve(ArtifactKind::Intermediate, Some(segment), "wav");
                scratch.push(pad.clone());
                self.ffmpeg.silence(silence, &pad.path).await?;

                let padded = store.reserve(ArtifactKind::Intermediate, Some(segment), "wav");
                scratch.push(padded.clone());
                self.ffmpeg
                    .concat_audio(&[&pad.path, &audio.path, &pad.path], &padded.path)
                    .await?;
                Ok(padded)
            }
            None => {
                warn!("Segment {} has no narration, composing a silent clip", segment);
                let track = store.reserve(ArtifactKind::Intermediate, Some(segment), "wav");
                scratch.push(track.clone());
                self.ffmpeg.silence(clip_duration, &track.path).await?;
                Ok(track)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn render(
        &self,
        store: &ArtifactStore,
        segment: usize,
        image: &Artifact,
        audio: Option<&Artifact>,
        silence: Duration,
        clip_duration: Duration,
        scratch: &mut Vec<Artifact>,
    ) -> Result<Artifact> {
        let track = self
            .soundtrack(store, segment, audio, silence, clip_duration, scratch)
            .await?;
        let clip = store.reserve(ArtifactKind::Clip, Some(segment), "mp4");
        if let Err(e) = self
            .ffmpeg
            .still_clip(&image.path, &track.path, clip_duration, &clip.path)
            .await
        {
            store.discard(&clip).await.ok();
            return Err(e);
        }
        Ok(clip)
    }
}

#[async_trait]
impl ClipComposer for FfmpegComposer {
    async fn compose(
        &self,
        store: &ArtifactStore,
        segment: usize,
        image: &Artifact,
        audio: Option<&Artifact>,
        silence: Duration,
        clip_duration: Duration,
    ) -> Result<Artifact> {
        info!("Composing clip for segment {}", segment);
        let mut scratch = Vec::new();
        let result = self
            .render(store, segment, image, audio, silence, clip_duration, &mut scratch)
            .await;

        for artifact in &scratch {
            store.discard(artifact).await.ok();
        }
        result
    }
}

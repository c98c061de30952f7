//! Drives one topic from script to combined video.
//!
//! ```text
//! Initialized ─▶ ScriptGenerated ─▶ AudioAttached ─▶ ClipsComposed ─▶ Combined ─▶ Done
//!      └───────────────┴────────────────┴────────────────┴──────────────┴──▶ Aborted
//! ```
//!
//! The scratch store is cleared when a run starts and removed when it ends,
//! whichever way it ends. Only the combined video (and, optionally, the
//! script JSON) survive, moved to the caller's output path.

use crate::api::{HttpVoice, ImageSynthesizer, OpenAiClient, ScriptWriter};
use crate::artifact::{Artifact, ArtifactKind, ArtifactStore};
use crate::config::{ImageFailurePolicy, MissingAudioPolicy, PipelineConfig};
use crate::error::{Result, RunFailure, VideoError};
use crate::script::{Script, Segment};
use crate::speech::Narrator;
use crate::video::{ClipComposer, ClipConcatenator, Ffmpeg, FfmpegComposer, FfmpegConcatenator};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Initialized,
    ScriptGenerated,
    AudioAttached,
    ClipsComposed,
    Combined,
    Done,
    Aborted,
}

/// Result of the image + composition stage for one segment that did not abort the run.
#[derive(Debug)]
pub enum SegmentOutcome {
    Ready { image: Artifact, clip: Artifact },
    /// Left out of the final video under the configured policy.
    Skipped(String),
}

/// A finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub topic: String,
    pub output: PathBuf,
    pub script: Script,
    pub state: RunState,
    /// States visited, in order.
    pub history: Vec<RunState>,
    /// Indices of segments that did not make it into the video.
    pub skipped: Vec<usize>,
}

/// The adapters a pipeline calls out to.
#[derive(Clone)]
pub struct Services {
    pub script_writer: Arc<dyn ScriptWriter>,
    pub narrator: Narrator,
    pub images: Arc<dyn ImageSynthesizer>,
    pub composer: Arc<dyn ClipComposer>,
    pub concatenator: Arc<dyn ClipConcatenator>,
}

impl Services {
    /// Real adapters: OpenAI for text and images, the HTTP voice service, FFmpeg.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let openai = Arc::new(OpenAiClient::new(
            config.openai.clone(),
            config.request_timeout,
            config.retry,
        )?);
        let voice = Arc::new(HttpVoice::new(config.voice.clone(), config.request_timeout)?);
        let ffmpeg = Ffmpeg::new(config.encoder.clone());
        Ok(Self {
            script_writer: openai.clone(),
            narrator: Narrator::new(voice, &config.voice),
            images: openai,
            composer: Arc::new(FfmpegComposer::new(ffmpeg.clone())),
            concatenator: Arc::new(FfmpegConcatenator::new(ffmpeg)),
        })
    }
}

struct RunTracker {
    history: Vec<RunState>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            history: vec![RunState::Initialized],
        }
    }

    fn state(&self) -> RunState {
        self.history
            .last()
            .copied()
            .unwrap_or(RunState::Initialized)
    }

    fn advance(&mut self, next: RunState) {
        info!("Run state: {:?} -> {:?}", self.state(), next);
        self.history.push(next);
    }
}

pub struct Pipeline {
    services: Services,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(services: Services, config: PipelineConfig) -> Self {
        Self { services, config }
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        Ok(Self::new(Services::from_config(&config)?, config))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Runs the whole pipeline for `topic`, leaving the combined video at `output`.
    pub async fn run(
        &self,
        topic: &str,
        segment_count: usize,
        output: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunReport, RunFailure> {
        let mut tracker = RunTracker::new();
        let abort = |tracker: &RunTracker, source: VideoError| RunFailure {
            topic: topic.to_string(),
            stage: tracker.state(),
            source,
        };

        if segment_count == 0 {
            return Err(abort(
                &tracker,
                VideoError::Config("segment count must be at least 1".into()),
            ));
        }
        let store = match ArtifactStore::open_run(
            &self.config.scratch_dir,
            self.config.scratch_stale_after,
        )
        .await
        {
            Ok(store) => store,
            Err(e) => return Err(abort(&tracker, e)),
        };
        info!("Starting run for '{}' in {}", topic, store.dir().display());

        match self
            .drive(&store, topic, segment_count, output, cancel, &mut tracker)
            .await
        {
            Ok((script, skipped)) => {
                if let Err(e) = store.close().await {
                    warn!("Failed to clean scratch files: {}", e);
                }
                tracker.advance(RunState::Done);
                info!("Run for '{}' done: {}", topic, output.display());
                Ok(RunReport {
                    topic: topic.to_string(),
                    output: output.to_path_buf(),
                    script,
                    state: RunState::Done,
                    history: tracker.history,
                    skipped,
                })
            }
            Err(source) => {
                let failure = abort(&tracker, source);
                error!("{}", failure);
                if self.config.keep_scratch_on_failure {
                    warn!("Keeping scratch files in {}", store.dir().display());
                    store.release().await;
                } else if let Err(e) = store.close().await {
                    warn!("Failed to clean scratch files: {}", e);
                }
                tracker.advance(RunState::Aborted);
                Err(failure)
            }
        }
    }

    async fn drive(
        &self,
        store: &ArtifactStore,
        topic: &str,
        segment_count: usize,
        output: &Path,
        cancel: &CancellationToken,
        tracker: &mut RunTracker,
    ) -> Result<(Script, Vec<usize>)> {
        boundary(store, cancel).await?;
        info!("Step 1/5: Generating script...");
        let mut script = self
            .services
            .script_writer
            .generate_script(topic, segment_count)
            .await?;
        tracker.advance(RunState::ScriptGenerated);

        boundary(store, cancel).await?;
        info!("Step 2/5: Generating narration for {} segments...", script.segments.len());
        self.attach_audio(store, &mut script, cancel).await?;
        tracker.advance(RunState::AudioAttached);

        boundary(store, cancel).await?;
        info!("Step 3/5: Generating images and clips...");
        let skipped = self.compose_clips(store, &mut script, cancel).await?;
        tracker.advance(RunState::ClipsComposed);

        boundary(store, cancel).await?;
        info!("Step 4/5: Concatenating clips...");
        let combined = self
            .services
            .concatenator
            .concatenate(store, &script.clips())
            .await?;
        tracker.advance(RunState::Combined);

        info!("Step 5/5: Saving output...");
        store.persist(&combined, output).await?;
        if self.config.save_script {
            let path = output.with_extension("json");
            tokio::fs::write(&path, serde_json::to_vec_pretty(&script)?).await?;
            info!("Saved script to {}", path.display());
        }
        Ok((script, skipped))
    }

    /// Speech stage: every segment is attempted; a segment without audio keeps `audio: None`.
    async fn attach_audio(
        &self,
        store: &ArtifactStore,
        script: &mut Script,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let narrator = &self.services.narrator;
        let audio: Vec<Option<Artifact>> = stream::iter(script.segments.iter())
            .map(|segment| async move {
                boundary(store, cancel).await?;
                narrator.narrate(store, segment.index, &segment.text).await
            })
            .buffered(self.config.segment_concurrency.max(1))
            .try_collect()
            .await?;

        for (segment, audio) in script.segments.iter_mut().zip(audio) {
            if audio.is_none() {
                if self.config.missing_audio == MissingAudioPolicy::Abort {
                    return Err(VideoError::SynthesisTotal(format!("segment {}", segment.index)));
                }
                warn!("Segment {} has no audio", segment.index);
            }
            segment.audio = audio;
        }
        Ok(())
    }

    /// Image and composition stage. Stops at the first fatal segment.
    async fn compose_clips(
        &self,
        store: &ArtifactStore,
        script: &mut Script,
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>> {
        let outcomes: Vec<SegmentOutcome> = stream::iter(script.segments.iter())
            .map(|segment| self.segment_clip(store, segment, cancel))
            .buffered(self.config.segment_concurrency.max(1))
            .try_collect()
            .await?;

        let mut skipped = Vec::new();
        for (segment, outcome) in script.segments.iter_mut().zip(outcomes) {
            match outcome {
                SegmentOutcome::Ready { image, clip } => {
                    segment.image = Some(image);
                    segment.clip = Some(clip);
                }
                SegmentOutcome::Skipped(reason) => {
                    warn!("Segment {} left out: {}", segment.index, reason);
                    skipped.push(segment.index);
                }
            }
        }

        if skipped.len() == script.segments.len() {
            return Err(VideoError::MissingInput("every segment was left out".into()));
        }
        Ok(skipped)
    }

    async fn segment_clip(
        &self,
        store: &ArtifactStore,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutcome> {
        boundary(store, cancel).await?;
        if segment.audio.is_none() && self.config.missing_audio == MissingAudioPolicy::Drop {
            return Ok(SegmentOutcome::Skipped("no narration audio".into()));
        }

        let image = match self.services.images.synthesize(&segment.prompt).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return match self.config.image_failure {
                    ImageFailurePolicy::Drop => Ok(SegmentOutcome::Skipped(e.to_string())),
                    ImageFailurePolicy::Abort => Err(e),
                }
            }
        };
        let image = store
            .write(ArtifactKind::Image, Some(segment.index), "jpg", &image)
            .await?;
        info!("Segment {} image saved: {}", segment.index, image.path.display());

        let clip = self
            .services
            .composer
            .compose(
                store,
                segment.index,
                &image,
                segment.audio.as_ref(),
                self.config.silence_duration,
                self.config.clip_duration,
            )
            .await?;
        Ok(SegmentOutcome::Ready { image, clip })
    }
}

/// Stops a cancelled run and keeps the run's lock marker fresh.
async fn boundary(store: &ArtifactStore, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(VideoError::Cancelled);
    }
    if let Err(e) = store.heartbeat().await {
        warn!("Failed to refresh run lock in {}: {}", store.dir().display(), e);
    }
    Ok(())
}

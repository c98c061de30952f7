pub mod composer;
pub mod concat;
pub mod ffmpeg;

use crate::artifact::{Artifact, ArtifactStore};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use composer::FfmpegComposer;
pub use concat::FfmpegConcatenator;
pub use ffmpeg::Ffmpeg;

/// Renders one segment's image and narration into a fixed-length clip.
#[async_trait]
pub trait ClipComposer: Send + Sync {
    /// `audio` is `None` when the segment has no narration; the clip is then silent.
    async fn compose(
        &self,
        store: &ArtifactStore,
        segment: usize,
        image: &Artifact,
        audio: Option<&Artifact>,
        silence: Duration,
        clip_duration: Duration,
    ) -> Result<Artifact>;
}

/// Joins clips, in the order given, into the combined video.
#[async_trait]
pub trait ClipConcatenator: Send + Sync {
    async fn concatenate(&self, store: &ArtifactStore, clips: &[Artifact]) -> Result<Artifact>;
}

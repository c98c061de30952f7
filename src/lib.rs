//! Turns a topic into a narrated slideshow video: script, speech, images,
//! clips, one combined MP4, and optionally an upload.

pub mod api;
pub mod artifact;
pub mod batch;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod script;
pub mod secrets;
pub mod speech;
pub mod video;

#[cfg(test)]
mod testing;

pub use artifact::{Artifact, ArtifactKind, ArtifactStore};
pub use batch::{BatchDriver, BatchEntry};
pub use config::PipelineConfig;
pub use error::{Result, RunFailure, VideoError};
pub use pipeline::{Pipeline, RunReport, RunState, Services};
pub use script::{Script, Segment};

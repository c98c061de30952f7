//! Adapters for the external services the pipeline talks to.
//!
//! Every adapter sits behind a trait so the orchestrator can be driven by
//! fakes in tests and each client carries its own credentials, base URL
//! and timeout.

pub mod openai;
pub mod retry;
pub mod voice;
pub mod youtube;

use crate::error::Result;
use crate::script::Script;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use openai::OpenAiClient;
pub use retry::RetryPolicy;
pub use voice::HttpVoice;
pub use youtube::YouTubePublisher;

/// Language-model backed writer of scripts and topic ideas.
#[async_trait]
pub trait ScriptWriter: Send + Sync {
    /// Produces a script with exactly `segment_count` segments.
    async fn generate_script(&self, subject: &str, segment_count: usize) -> Result<Script>;

    /// Expands a broad theme into up to `count` concrete topics.
    async fn generate_ideas(&self, meta_topic: &str, count: usize) -> Result<Vec<String>>;
}

/// Synthesizes one sentence-sized unit of narration into WAV bytes.
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    async fn synthesize_unit(&self, text: &str) -> Result<Vec<u8>>;
}

/// Turns a visual description into encoded image bytes.
#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    async fn synthesize(&self, prompt: &str) -> Result<Vec<u8>>;
}

/// Metadata sent along with an uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category: String,
    pub privacy_status: String,
}

impl VideoMetadata {
    pub fn from_script(script: &Script, privacy_status: &str) -> Self {
        Self {
            title: script.title.clone(),
            description: script.description.clone(),
            tags: script.tags(),
            category: script.category.clone(),
            privacy_status: privacy_status.to_string(),
        }
    }
}

/// Uploads a finished video to a hosting platform, returning the platform's video id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, video: &Path, metadata: &VideoMetadata) -> Result<String>;
}

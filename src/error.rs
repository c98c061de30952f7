use crate::pipeline::RunState;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VideoError {
    /// Model output could not be parsed into the expected document.
    #[error("Generation format error: {0}")]
    GenerationFormat(String),

    #[error("Speech unit synthesis failed: {0}")]
    SynthesisUnit(String),

    #[error("Speech synthesis produced no audio for: {0}")]
    SynthesisTotal(String),

    #[error("Image synthesis failed: {0}")]
    ImageSynthesis(String),

    #[error("{tool} failed while {stage}: {detail}")]
    ExternalTool {
        tool: String,
        stage: String,
        detail: String,
    },

    #[error("Upload failed: {0}")]
    Transfer(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Authorization error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {0:?} while {1}")]
    Timeout(std::time::Duration, String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl VideoError {
    pub fn tool(tool: impl Into<String>, stage: impl Into<String>, detail: impl Into<String>) -> Self {
        VideoError::ExternalTool {
            tool: tool.into(),
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Failures worth another attempt: transport errors, timeouts and 5xx/429 answers.
    pub fn is_transient(&self) -> bool {
        match self {
            VideoError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .map(|s| s.is_server_error() || s.as_u16() == 429)
                        .unwrap_or(false)
            }
            VideoError::Timeout(..) => true,
            VideoError::Api(msg) => msg.starts_with("HTTP 5") || msg.starts_with("HTTP 429"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VideoError>;

/// A fatal error for one topic's run, with enough context to re-run just that topic.
#[derive(Debug)]
pub struct RunFailure {
    pub topic: String,
    /// Last state the run reached before aborting.
    pub stage: RunState,
    pub source: VideoError,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run for topic '{}' aborted after {:?}: {}",
            self.topic, self.stage, self.source
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

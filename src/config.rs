use crate::api::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// What to do with a segment whose speech synthesis produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MissingAudioPolicy {
    /// Compose the clip over a silent track.
    Silent,
    /// Leave the segment out of the final video.
    Drop,
    /// Abort the run.
    Abort,
}

/// What to do when image synthesis fails for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ImageFailurePolicy {
    Abort,
    Drop,
}

/// Language model and image endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub image_model: String,
    pub image_size: String,
    pub image_quality: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            chat_model: env_or("OPENAI_CHAT_MODEL", "gpt-4-1106-preview"),
            image_model: env_or("OPENAI_IMAGE_MODEL", "dall-e-3"),
            image_size: env_or("OPENAI_IMAGE_SIZE", "1024x1024"),
            image_quality: env_or("OPENAI_IMAGE_QUALITY", "standard"),
        }
    }
}

/// Query knobs of the speech-synthesis service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub url: String,
    pub model_id: u32,
    pub speaker_id: u32,
    pub sdp_ratio: f32,
    pub noise: f32,
    pub noisew: f32,
    pub length: f32,
    pub language: String,
    pub auto_split: bool,
    pub split_interval: f32,
    pub assist_text_weight: f32,
    pub style: String,
    pub style_weight: f32,
    /// Sentence terminator used to split narration into synthesis units.
    pub terminator: char,
    /// Silence inserted between units.
    pub unit_gap: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            url: env_or("VOICE_API_URL", "http://127.0.0.1:5000/voice"),
            model_id: env_parse("VOICE_MODEL_ID", 4),
            speaker_id: env_parse("VOICE_SPEAKER_ID", 0),
            sdp_ratio: 0.6,
            noise: 0.7,
            noisew: 1.1,
            length: env_parse("VOICE_LENGTH", 0.75),
            language: env_or("VOICE_LANGUAGE", "JP"),
            auto_split: true,
            split_interval: 0.5,
            assist_text_weight: 1.0,
            style: env_or("VOICE_STYLE", "Neutral"),
            style_weight: 5.0,
            terminator: '。',
            unit_gap: Duration::from_millis(1000),
        }
    }
}

/// FFmpeg invocation settings shared by composer and concatenator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub ffmpeg: PathBuf,
    pub frame_rate: u32,
    pub pixel_format: String,
    pub video_codec: String,
    pub audio_codec: String,
    /// lavfi source used for silence tracks.
    pub silence_source: String,
    pub timeout: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from(env_or("FFMPEG_PATH", "ffmpeg")),
            frame_rate: env_parse("VIDEO_FPS", 24),
            pixel_format: "yuv420p".into(),
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            silence_source: "anullsrc=r=44100:cl=stereo".into(),
            timeout: Duration::from_secs(env_parse("TOOL_TIMEOUT_SECS", 600)),
        }
    }
}

/// Hosting-platform upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    pub client_secrets_file: PathBuf,
    pub token_cache_file: PathBuf,
    pub scopes: Vec<String>,
    pub privacy_status: String,
    /// Upload chunk size, a multiple of 256 KiB.
    pub chunk_size: usize,
    /// How many times a broken chunk transfer may resume before giving up.
    pub max_resumes: u32,
    /// First wait before resuming; doubles on every further resume.
    pub resume_delay: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            client_secrets_file: PathBuf::from(env_or("CLIENT_SECRETS_FILE", "client_secrets.json")),
            token_cache_file: PathBuf::from(env_or("TOKEN_CACHE_FILE", "token.json")),
            scopes: env_or("SCOPES", "https://www.googleapis.com/auth/youtube.upload")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            privacy_status: env_or("PRIVACY_STATUS", "private"),
            chunk_size: env_parse("UPLOAD_CHUNK_SIZE", 8 * 1024 * 1024),
            max_resumes: 5,
            resume_delay: Duration::from_secs(1),
        }
    }
}

/// Runtime configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Silence padded before and after each narration.
    pub silence_duration: Duration,
    pub clip_duration: Duration,
    pub request_timeout: Duration,
    /// Segments processed at once in the per-segment stages.
    pub segment_concurrency: usize,
    pub missing_audio: MissingAudioPolicy,
    pub image_failure: ImageFailurePolicy,
    pub keep_scratch_on_failure: bool,
    /// Run directories whose lock marker is older than this are swept at run start.
    pub scratch_stale_after: Duration,
    /// Write the final script as JSON next to the output video.
    pub save_script: bool,
    pub retry: RetryPolicy,
    pub openai: OpenAiConfig,
    pub voice: VoiceConfig,
    pub encoder: EncoderConfig,
    pub publish: PublishConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from(env_or("SCRATCH_DIR", "./temp")),
            output_dir: PathBuf::from(env_or("OUTPUT_DIR", "./output")),
            silence_duration: Duration::from_millis(500),
            clip_duration: Duration::from_secs(10),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 120)),
            segment_concurrency: env_parse("SEGMENT_CONCURRENCY", 1usize).max(1),
            missing_audio: MissingAudioPolicy::Silent,
            image_failure: ImageFailurePolicy::Abort,
            keep_scratch_on_failure: false,
            scratch_stale_after: Duration::from_secs(env_parse("SCRATCH_STALE_SECS", 3600)),
            save_script: false,
            retry: RetryPolicy::default(),
            openai: OpenAiConfig::default(),
            voice: VoiceConfig::default(),
            encoder: EncoderConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

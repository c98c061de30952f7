use super::VoiceEngine;
use crate::config::VoiceConfig;
use crate::error::{Result, VideoError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Speech service reached with a plain GET carrying the text and voice knobs.
#[derive(Debug, Clone)]
pub struct HttpVoice {
    config: VoiceConfig,
    client: Client,
}

impl HttpVoice {
    pub fn new(config: VoiceConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VideoError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn query(&self, text: &str) -> Vec<(&'static str, String)> {
        let c = &self.config;
        vec![
            ("text", text.to_string()),
            ("encoding", "utf-8".to_string()),
            ("model_id", c.model_id.to_string()),
            ("speaker_id", c.speaker_id.to_string()),
            ("sdp_ratio", c.sdp_ratio.to_string()),
            ("noise", c.noise.to_string()),
            ("noisew", c.noisew.to_string()),
            ("length", c.length.to_string()),
            ("language", c.language.clone()),
            ("auto_split", c.auto_split.to_string()),
            ("split_interval", c.split_interval.to_string()),
            ("assist_text_weight", c.assist_text_weight.to_string()),
            ("style", c.style.clone()),
            ("style_weight", c.style_weight.to_string()),
        ]
    }
}

/// Only a 200 carrying WAV audio counts as a synthesized unit.
fn is_wav_response(status: StatusCode, content_type: Option<&str>) -> bool {
    status == StatusCode::OK && content_type.map(|ct| ct.contains("audio/wav")).unwrap_or(false)
}

#[async_trait]
impl VoiceEngine for HttpVoice {
    async fn synthesize_unit(&self, text: &str) -> Result<Vec<u8>> {
        debug!("Requesting speech for unit: {}", text);
        let response = self
            .client
            .get(&self.config.url)
            .query(&self.query(text))
            .send()
            .await
            .map_err(|e| VideoError::SynthesisUnit(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !is_wav_response(status, content_type.as_deref()) {
            return Err(VideoError::SynthesisUnit(format!(
                "HTTP {} with content type {:?}",
                status.as_u16(),
                content_type
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VideoError::SynthesisUnit(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

use crate::artifact::Artifact;
use crate::error::{Result, VideoError};
use serde::{Deserialize, Deserializer, Serialize};

/// One video's script: title, description, category and ordered segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub description: String,
    /// Comma separated topic tags.
    #[serde(default)]
    pub topic: String,
    /// Hosting-platform category id, e.g. "22".
    #[serde(default = "default_category", deserialize_with = "category_code")]
    pub category: String,
    #[serde(rename = "clips")]
    pub segments: Vec<Segment>,
}

/// One segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "num")]
    pub index: usize,
    #[serde(default)]
    pub title: String,
    /// Narration, one sentence.
    pub text: String,
    /// Visual description for image synthesis.
    #[serde(rename = "video_prompt")]
    pub prompt: String,
    #[serde(rename = "subtitles", default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip: Option<Artifact>,
}

fn default_category() -> String {
    "22".to_string()
}

fn category_code<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "category must be a string or number, got {}",
            other
        ))),
    }
}

/// Strips a Markdown code fence the model may wrap its JSON in.
pub fn strip_code_fence(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

impl Segment {
    pub fn new(index: usize, title: &str, text: &str, prompt: &str) -> Self {
        Self {
            index,
            title: title.to_string(),
            text: text.to_string(),
            prompt: prompt.to_string(),
            subtitle: None,
            audio: None,
            image: None,
            clip: None,
        }
    }
}

impl Script {
    /// Parses a model response and checks it has exactly `segment_count`
    /// segments numbered `0..segment_count`.
    pub fn from_model_output(raw: &str, segment_count: usize) -> Result<Self> {
        let mut script: Script = serde_json::from_str(strip_code_fence(raw))
            .map_err(|e| VideoError::GenerationFormat(format!("script JSON: {}", e)))?;

        script.segments.sort_by_key(|s| s.index);
        if script.segments.len() != segment_count {
            return Err(VideoError::GenerationFormat(format!(
                "expected {} segments, model returned {}",
                segment_count,
                script.segments.len()
            )));
        }
        for (expected, segment) in script.segments.iter().enumerate() {
            if segment.index != expected {
                return Err(VideoError::GenerationFormat(format!(
                    "segment indices must run 0..{}, found {} at position {}",
                    segment_count, segment.index, expected
                )));
            }
        }
        Ok(script)
    }

    /// Topic tags, split on ASCII and Japanese commas.
    pub fn tags(&self) -> Vec<String> {
        self.topic
            .split([',', '、', '，'])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Clips in segment order, skipping segments that produced none.
    pub fn clips(&self) -> Vec<Artifact> {
        self.segments.iter().filter_map(|s| s.clip.clone()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct IdeaBatch {
    ideas: Vec<String>,
}

/// Parses an `{"ideas": [...]}` response, keeping at most `count` non-empty ideas.
pub fn parse_ideas(raw: &str, count: usize) -> Result<Vec<String>> {
    let batch: IdeaBatch = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| VideoError::GenerationFormat(format!("ideas JSON: {}", e)))?;
    let ideas: Vec<String> = batch
        .ideas
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .take(count)
        .collect();
    if ideas.is_empty() {
        return Err(VideoError::GenerationFormat("model returned no ideas".into()));
    }
    Ok(ideas)
}

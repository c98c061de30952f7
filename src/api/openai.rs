use super::retry::RetryPolicy;
use super::{ImageSynthesizer, ScriptWriter};
use crate::config::OpenAiConfig;
use crate::error::{Result, VideoError};
use crate::script::{parse_ideas, Script};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const SCRIPT_FORMAT: &str = r#"
次の形式のJSONだけを出力してください。
{
  "title": "動画のタイトル",
  "description": "動画の説明文",
  "topic": "タグをカンマ区切りで",
  "category": "YouTubeのカテゴリID (例: \"22\")",
  "clips": [
    {
      "num": 0,
      "title": "クリップの見出し",
      "text": "読み上げる文章。必ず1文。",
      "video_prompt": "そのクリップの画像を生成するための情景描写",
      "subtitles": "字幕"
    }
  ]
}
numは0から始まる連番にしてください。
YouTubeショート向けに、具体的な情報をニュース風の短い文で伝え、最後にオチをつけてください。
"#;

const IDEAS_FORMAT: &str = r#"
次の形式のJSONだけを出力してください。
{"ideas": ["アイデア1", "アイデア2"]}
"#;

const IMAGE_PROMPT_SUFFIX: &str =
    " - できる限りリアルな画像を生成してください。極端で印象的な描写にしてください。";

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
}

/// Chat-completions and image-generation client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    api_key: String,
    config: OpenAiConfig,
    retry: RetryPolicy,
    client: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| VideoError::Config("OPENAI_API_KEY is not set".into()))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VideoError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            config,
            retry,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Sends one JSON-mode chat request and returns the message content.
    async fn chat_json(&self, user_prompt: &str) -> Result<String> {
        let request_body = json!({
            "model": self.config.chat_model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt }
            ],
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VideoError::Api(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        let response_json: Value = response.json().await?;
        extract_message_content(&response_json)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VideoError::Api(format!(
                "HTTP {}: image download failed",
                status.as_u16()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn extract_message_content(response: &Value) -> Result<String> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| VideoError::GenerationFormat("response has no message content".into()))
}

pub(crate) fn script_prompt(subject: &str, segment_count: usize) -> String {
    format!(
        "次の条件で動画のスクリプトをJSONで生成してください。\n主題: {}\nクリップ数: {}\n{}",
        subject, segment_count, SCRIPT_FORMAT
    )
}

pub(crate) fn ideas_prompt(meta_topic: &str, count: usize) -> String {
    format!(
        "次のメタトピックに沿って、YouTubeショート動画のアイデアを考えてください。\nメタトピック: {}\nアイデアの個数: {}\n{}",
        meta_topic, count, IDEAS_FORMAT
    )
}

#[async_trait]
impl ScriptWriter for OpenAiClient {
    async fn generate_script(&self, subject: &str, segment_count: usize) -> Result<Script> {
        if segment_count == 0 {
            return Err(VideoError::Config("segment count must be at least 1".into()));
        }
        info!("Generating script for '{}' ({} segments)...", subject, segment_count);

        let prompt = script_prompt(subject, segment_count);
        let content = self
            .retry
            .run("script generation", || self.chat_json(&prompt))
            .await?;
        debug!("Script response: {}", content);

        let script = Script::from_model_output(&content, segment_count)?;
        info!("Generated script '{}'", script.title);
        Ok(script)
    }

    async fn generate_ideas(&self, meta_topic: &str, count: usize) -> Result<Vec<String>> {
        info!("Generating {} ideas for '{}'...", count, meta_topic);

        let prompt = ideas_prompt(meta_topic, count);
        let content = self
            .retry
            .run("idea generation", || self.chat_json(&prompt))
            .await?;
        debug!("Ideas response: {}", content);

        parse_ideas(&content, count)
    }
}

#[async_trait]
impl ImageSynthesizer for OpenAiClient {
    async fn synthesize(&self, prompt: &str) -> Result<Vec<u8>> {
        info!("Generating image for prompt: {}", prompt);

        let request_body = json!({
            "model": self.config.image_model,
            "prompt": format!("{}{}", prompt, IMAGE_PROMPT_SUFFIX),
            "size": self.config.image_size,
            "quality": self.config.image_quality,
            "n": 1
        });

        let response = self
            .client
            .post(self.endpoint("images/generations"))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| VideoError::ImageSynthesis(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VideoError::ImageSynthesis(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        let generated: ImageGenerationResponse = response
            .json()
            .await
            .map_err(|e| VideoError::ImageSynthesis(format!("bad response: {}", e)))?;
        let url = generated
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| VideoError::ImageSynthesis("no image URL in response".into()))?;

        info!("Downloading image from: {}", url);
        self.retry
            .run("image download", || self.fetch_image(&url))
            .await
            .map_err(|e| VideoError::ImageSynthesis(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OpenAiConfig {
        OpenAiConfig {
            api_key: Some("sk-test".into()),
            base_url: "https://example.test/v1/".into(),
            chat_model: "gpt-test".into(),
            image_model: "img-test".into(),
            image_size: "1024x1024".into(),
            image_quality: "standard".into(),
        }
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let config = OpenAiConfig {
            api_key: None,
            ..test_config()
        };
        let err = OpenAiClient::new(config, Duration::from_secs(5), RetryPolicy::none()).unwrap_err();
        assert!(matches!(err, VideoError::Config(_)));
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let client = OpenAiClient::new(test_config(), Duration::from_secs(5), RetryPolicy::none()).unwrap();
        assert_eq!(
            client.endpoint("/chat/completions"),
            "https://example.test/v1/chat/completions"
        );
    }

    #[test]
    fn test_extract_message_content() {
        let response = json!({
            "choices": [{ "message": { "content": "  {\"ideas\": []}  " } }]
        });
        assert_eq!(extract_message_content(&response).unwrap(), "{\"ideas\": []}");

        let empty = json!({ "choices": [] });
        assert!(matches!(
            extract_message_content(&empty),
            Err(VideoError::GenerationFormat(_))
        ));
    }

    #[test]
    fn test_prompts_carry_subject_and_count() {
        let prompt = script_prompt("自然の美", 2);
        assert!(prompt.contains("自然の美"));
        assert!(prompt.contains("クリップ数: 2"));
        assert!(prompt.contains("video_prompt"));

        let prompt = ideas_prompt("1000年後の世界", 5);
        assert!(prompt.contains("1000年後の世界"));
        assert!(prompt.contains("\"ideas\""));
    }

    mod server {
        use super::*;
        use axum::extract::State;
        use axum::http::{header, HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::{Arc, Mutex};

        /// In-memory stand-in for the chat, image and file-hosting endpoints.
        struct FakeOpenAi {
            base: String,
            /// Requests answered with 503 before each endpoint starts succeeding.
            flaky: u32,
            generation_status: StatusCode,
            chats: AtomicU32,
            downloads: AtomicU32,
            prompts: Mutex<Vec<String>>,
        }

        async fn chat(State(api): State<Arc<FakeOpenAi>>) -> Response {
            if api.chats.fetch_add(1, Ordering::SeqCst) < api.flaky {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            let content = r#"{"ideas": ["火山の秘密", "深海の生き物"]}"#;
            Json(json!({ "choices": [{ "message": { "content": content } }] })).into_response()
        }

        async fn generate(
            State(api): State<Arc<FakeOpenAi>>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Response {
            assert_eq!(
                headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
                Some("Bearer sk-test")
            );
            api.prompts
                .lock()
                .unwrap()
                .push(body["prompt"].as_str().unwrap_or_default().to_string());
            if !api.generation_status.is_success() {
                return api.generation_status.into_response();
            }
            let url = format!("{}/files/image.jpg", api.base);
            Json(json!({ "data": [{ "url": url }] })).into_response()
        }

        async fn download(State(api): State<Arc<FakeOpenAi>>) -> Response {
            if api.downloads.fetch_add(1, Ordering::SeqCst) < api.flaky {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            vec![0xffu8, 0xd8, 0xff, 0xe0].into_response()
        }

        async fn serve(flaky: u32, generation_status: StatusCode) -> (OpenAiClient, Arc<FakeOpenAi>) {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let api = Arc::new(FakeOpenAi {
                base: base.clone(),
                flaky,
                generation_status,
                chats: AtomicU32::new(0),
                downloads: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            });
            let app = Router::new()
                .route("/v1/chat/completions", post(chat))
                .route("/v1/images/generations", post(generate))
                .route("/files/image.jpg", get(download))
                .with_state(api.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            let config = OpenAiConfig {
                base_url: format!("{}/v1", base),
                ..test_config()
            };
            let retry = RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            };
            let client = OpenAiClient::new(config, Duration::from_secs(10), retry).unwrap();
            (client, api)
        }

        #[tokio::test]
        async fn test_image_is_downloaded_from_returned_url() {
            let (client, api) = serve(1, StatusCode::OK).await;

            let bytes = client.synthesize("夜の火山").await.unwrap();

            assert_eq!(bytes, vec![0xff, 0xd8, 0xff, 0xe0]);
            assert_eq!(api.downloads.load(Ordering::SeqCst), 2);
            let prompts = api.prompts.lock().unwrap();
            assert_eq!(prompts.len(), 1);
            assert!(prompts[0].starts_with("夜の火山"));
            assert!(prompts[0].ends_with(IMAGE_PROMPT_SUFFIX));
        }

        #[tokio::test]
        async fn test_download_gives_up_after_retries() {
            let (client, api) = serve(10, StatusCode::OK).await;

            let err = client.synthesize("夜の火山").await.unwrap_err();

            assert!(matches!(err, VideoError::ImageSynthesis(_)));
            assert_eq!(api.downloads.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn test_generation_failure_is_not_retried() {
            let (client, api) = serve(0, StatusCode::INTERNAL_SERVER_ERROR).await;

            let err = client.synthesize("夜の火山").await.unwrap_err();

            assert!(matches!(err, VideoError::ImageSynthesis(ref msg) if msg.starts_with("HTTP 500")));
            assert_eq!(api.prompts.lock().unwrap().len(), 1);
            assert_eq!(api.downloads.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_ideas_survive_a_busy_chat_endpoint() {
            let (client, api) = serve(2, StatusCode::OK).await;

            let ideas = client.generate_ideas("自然", 5).await.unwrap();

            assert_eq!(ideas, vec!["火山の秘密", "深海の生き物"]);
            assert_eq!(api.chats.load(Ordering::SeqCst), 3);
        }
    }
}

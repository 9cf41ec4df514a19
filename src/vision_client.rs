use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{HighlightError, HighlightResult};
use crate::scorer::{build_prompt, parse_score_response, ScoreResult, Scorer, ScoringContext};

pub const DEFAULT_ENDPOINT: &str = "https://integrate.api.nvidia.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "meta/llama-3.2-90b-vision-instruct";

/// 视觉模型客户端配置
#[derive(Debug, Clone)]
pub struct VisionClientConfig {
    /// chat completions 接口完整地址
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// 单次请求超时
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for VisionClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI 兼容的视觉模型评分客户端
///
/// 代表帧以 `data:image/jpeg;base64,...` 内联到请求中，提示词为 0-100 评分标准。
pub struct VisionClient {
    http: Client,
    config: VisionClientConfig,
}

impl VisionClient {
    pub fn new(config: VisionClientConfig) -> HighlightResult<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &VisionClientConfig {
        &self.config
    }

    async fn encode_frame(frame: &Path) -> HighlightResult<String> {
        let bytes = tokio::fs::read(frame).await?;
        Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes)))
    }
}

#[async_trait]
impl Scorer for VisionClient {
    async fn score(&self, frame: &Path, context: &ScoringContext) -> HighlightResult<ScoreResult> {
        let image = Self::encode_frame(frame).await?;
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image },
                    },
                    ContentPart::Text {
                        text: build_prompt(context),
                    },
                ],
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!("🤖 [评分] 场景 {} 请求 {}", context.scene_index, self.config.endpoint);

        let mut builder = self.http.post(&self.config.endpoint).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!("评分服务暂时不可用: {}", status);
            response.error_for_status_ref()?;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HighlightError::ScoringFailed {
                scene_index: context.scene_index,
                message: format!("评分服务返回 {}: {}", status, body),
            });
        }

        let body = response.text().await?;
        let chat: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| HighlightError::malformed(format!("响应体无法解析: {}", e)))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| HighlightError::malformed("响应中没有 choices[0].message.content"))?;

        parse_score_response(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::scorer::{score_with_retry, VideoPosition};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> ScoringContext {
        ScoringContext {
            scene_index: 2,
            timestamp: 31.5,
            duration: 9.0,
            position: VideoPosition::Early,
            optimize_for: "excitement".to_string(),
            genre: None,
            prior_scores: Vec::new(),
            frame_hint: None,
        }
    }

    fn client_for(server: &MockServer) -> VisionClient {
        VisionClient::new(VisionClientConfig {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            api_key: Some("test-key".to_string()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    fn frame_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"\xff\xd8fake-jpeg").unwrap();
        file
    }

    #[tokio::test]
    async fn test_scores_frame() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "model": DEFAULT_MODEL, "max_tokens": 512 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                "```json\n{\"score\": 93, \"reasoning\": \"triple kill\", \"description\": \"Triple headshot\"}\n```",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let frame = frame_file();
        let result = client_for(&server).score(frame.path(), &context()).await.unwrap();

        assert_eq!(result.score, 93);
        assert_eq!(result.label, "Triple headshot");
        assert_eq!(result.rationale, "triple kill");
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let frame = frame_file();
        let err = client_for(&server).score(frame.path(), &context()).await.unwrap_err();
        assert!(matches!(err, HighlightError::MalformedScore(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("{\"score\": 150, \"description\": \"too hype\"}")),
            )
            .mount(&server)
            .await;

        let frame = frame_file();
        let err = client_for(&server).score(frame.path(), &context()).await.unwrap_err();
        assert!(matches!(err, HighlightError::MalformedScore(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let frame = frame_file();
        let client = client_for(&server);
        let retry = RetryConfig::new("score").with_base_delay(Duration::from_millis(1));
        let err = score_with_retry(&client, frame.path(), &context(), &retry)
            .await
            .unwrap_err();

        assert!(matches!(err, HighlightError::ScoringFailed { scene_index: 2, .. }));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .expect(1)
            .mount(&server)
            .await;

        let frame = frame_file();
        let client = client_for(&server);
        let retry = RetryConfig::new("score").with_base_delay(Duration::from_millis(1));
        let err = score_with_retry(&client, frame.path(), &context(), &retry)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("401"));
    }
}

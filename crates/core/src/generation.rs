use crate::error::{ProviderError, ProviderFailure};
use crate::http::send_json;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

/// A grounded prompt split the way chat-style vendors expect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String, ProviderError>;
}

fn endpoint(provider: &str, base: &Url, path: &str) -> Result<Url, ProviderError> {
    base.join(path)
        .map_err(|error| ProviderError::new(provider, ProviderFailure::NotConfigured, error.to_string()))
}

fn non_empty(provider: &str, text: Option<String>) -> Result<String, ProviderError> {
    text.map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| ProviderError::new(provider, ProviderFailure::MalformedResponse, "response contained no text"))
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// OpenAI-compatible `POST {base}/chat/completions`.
pub struct OpenAiGenerator {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
}

impl OpenAiGenerator {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    pub fn new(base_url: Url, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let url = endpoint("openai", &self.base_url, "chat/completions")?;
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: 0.0,
        };
        let mut request = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response: ChatResponse = send_json("openai", request).await?;
        let content = response.choices.into_iter().next().and_then(|choice| choice.message.content);
        non_empty("openai", content)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic `POST {base}/v1/messages`.
pub struct AnthropicGenerator {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
}

impl AnthropicGenerator {
    pub const DEFAULT_MODEL: &'static str = "claude-3-5-haiku-latest";
    const API_VERSION: &'static str = "2023-06-01";
    const MAX_TOKENS: u32 = 1024;

    pub fn new(base_url: Url, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl GenerationProvider for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let Some(api_key) = &self.api_key else {
            return Err(ProviderError::new(
                "anthropic",
                ProviderFailure::NotConfigured,
                "no API key configured",
            ));
        };
        let url = endpoint("anthropic", &self.base_url, "v1/messages")?;
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: Self::MAX_TOKENS,
            system: &prompt.system,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt.user,
            }],
        };
        let request = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&body);

        let response: MessagesResponse = send_json("anthropic", request).await?;
        let text = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        non_empty("anthropic", Some(text))
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: Option<String>,
}

/// Local Ollama `POST /api/generate` without streaming.
pub struct OllamaGenerator {
    client: Client,
    base_url: Url,
    model: String,
}

impl OllamaGenerator {
    pub const DEFAULT_MODEL: &'static str = "llama3.1";

    pub fn new(base_url: Url, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let url = endpoint("ollama", &self.base_url, "api/generate")?;
        let request = self.client.post(url).json(&OllamaGenerateRequest {
            model: &self.model,
            system: &prompt.system,
            prompt: &prompt.user,
            stream: false,
        });
        let response: OllamaGenerateResponse = send_json("ollama", request).await?;
        non_empty("ollama", response.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prompt() -> Prompt {
        Prompt {
            system: "answer from context".to_string(),
            user: "what is the pressure?".to_string(),
        }
    }

    fn base(server: &MockServer, suffix: &str) -> Url {
        Url::parse(&format!("{}/{suffix}", server.uri())).expect("mock url")
    }

    #[tokio::test]
    async fn openai_chat_completion_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": " 42 bar [1] "}}]
            })))
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new(base(&server, "v1/"), Some("secret".to_string()), None);
        let answer = generator.generate(&prompt()).await.expect("mocked completion");
        assert_eq!(answer, "42 bar [1]");
    }

    #[tokio::test]
    async fn anthropic_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "Forty"}, {"type": "text", "text": "-two."}]
            })))
            .mount(&server)
            .await;

        let generator = AnthropicGenerator::new(base(&server, ""), Some("k".to_string()), None);
        assert_eq!(generator.generate(&prompt()).await.expect("mocked"), "Forty-two.");
    }

    #[tokio::test]
    async fn anthropic_without_key_is_not_configured() {
        let generator = AnthropicGenerator::new(Url::parse("http://localhost:1/").expect("url"), None, None);
        let error = generator.generate(&prompt()).await.unwrap_err();
        assert_eq!(error.kind, ProviderFailure::NotConfigured);
    }

    #[tokio::test]
    async fn ollama_requests_non_streaming_generation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "ok"})))
            .mount(&server)
            .await;

        let generator = OllamaGenerator::new(base(&server, ""), None);
        assert_eq!(generator.generate(&prompt()).await.expect("mocked"), "ok");
    }

    #[tokio::test]
    async fn empty_completion_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new(base(&server, ""), None, None);
        let error = generator.generate(&prompt()).await.unwrap_err();
        assert_eq!(error.kind, ProviderFailure::MalformedResponse);
    }
}

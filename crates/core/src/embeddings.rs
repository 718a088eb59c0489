use crate::error::{ProviderError, ProviderFailure};
use crate::http::{guarded, send_json};
use crate::models::EmbeddingState;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Vectors from different spaces must never be compared.
    fn embedding_space(&self) -> String {
        format!("{}:{}:{}", self.name(), self.model(), self.dimensions())
    }

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Deterministic character-trigram hashing embedder. Needs no network, so it
/// serves offline deployments and tests.
#[derive(Debug, Clone, Copy)]
pub struct NgramEmbedder {
    pub dimensions: usize,
}

impl Default for NgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl NgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for c in window {
                let mut buffer = [0u8; 4];
                for byte in c.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for NgramEmbedder {
    fn name(&self) -> &str {
        "ngram"
    }

    fn model(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Any OpenAI-compatible `POST {base}/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    /// Sent as `dimensions` so the vendor shortens its vectors to match.
    requested_dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    /// `dimensions` defaults to the model's native width when known.
    pub fn new(base_url: Url, api_key: Option<String>, model: Option<String>, dimensions: Option<usize>) -> Self {
        let model = model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());
        Self {
            client: Client::new(),
            base_url,
            api_key,
            dimensions: dimensions.unwrap_or_else(|| native_dimensions(&model)),
            requested_dimensions: dimensions,
            model,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = self
            .base_url
            .join("embeddings")
            .map_err(|error| ProviderError::new("openai", ProviderFailure::NotConfigured, error.to_string()))?;
        let mut request = self.client.post(url).json(&OpenAiEmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dimensions,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let mut response: OpenAiEmbeddingResponse = send_json("openai", request).await?;
        response.data.sort_by_key(|item| item.index);
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// A local Ollama instance's `POST /api/embed`.
pub struct OllamaEmbedder {
    client: Client,
    base_url: Url,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";

    pub fn new(base_url: Url, model: Option<String>, dimensions: Option<usize>) -> Self {
        let model = model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());
        Self {
            client: Client::new(),
            base_url,
            dimensions: dimensions.unwrap_or_else(|| native_dimensions(&model)),
            model,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = self
            .base_url
            .join("api/embed")
            .map_err(|error| ProviderError::new("ollama", ProviderFailure::NotConfigured, error.to_string()))?;
        let request = self.client.post(url).json(&OllamaEmbedRequest {
            model: &self.model,
            input: texts,
        });
        let response: OllamaEmbedResponse = send_json("ollama", request).await?;
        Ok(response.embeddings)
    }
}

/// Output width of well-known embedding models. Unknown models need an
/// explicit dimension count.
pub fn native_dimensions(model: &str) -> usize {
    let base = model.split(':').next().unwrap_or(model);
    match base {
        "text-embedding-3-large" => 3072,
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        "mxbai-embed-large" | "bge-large" | "snowflake-arctic-embed" => 1024,
        "all-minilm" => 384,
        _ => 768,
    }
}

/// Per-chunk result of tolerant embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingOutcome {
    pub position: usize,
    pub state: EmbeddingState,
    pub vector: Option<Vec<f32>>,
    pub error: Option<ProviderError>,
}

/// Wraps a provider with timeouts, cancellation and result validation.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    batch_size: usize,
}

impl EmbeddingGenerator {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, timeout: Duration, batch_size: usize) -> Self {
        Self {
            provider,
            timeout,
            batch_size: batch_size.max(1),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn embedding_space(&self) -> String {
        self.provider.embedding_space()
    }

    pub async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()], cancel).await?;
        vectors.pop().ok_or_else(|| {
            ProviderError::new(self.provider.name(), ProviderFailure::MalformedResponse, "empty embedding response")
        })
    }

    /// All-or-nothing: any failure fails the whole batch.
    pub async fn embed_batch(&self, texts: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let name = self.provider.name();
        let vectors = guarded(name, self.timeout, cancel, self.provider.embed_batch(texts)).await?;
        self.validate(texts.len(), &vectors)?;
        Ok(vectors)
    }

    /// Embeds in batches; a failed batch is retried once member by member so
    /// one bad chunk cannot sink its neighbours. Cancellation still aborts.
    pub async fn embed_tolerant(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<EmbeddingOutcome>, ProviderError> {
        let mut outcomes = Vec::with_capacity(texts.len());
        for (batch_number, batch) in texts.chunks(self.batch_size).enumerate() {
            let offset = batch_number * self.batch_size;
            match self.embed_batch(batch, cancel).await {
                Ok(vectors) => {
                    outcomes.extend(vectors.into_iter().enumerate().map(|(i, vector)| EmbeddingOutcome {
                        position: offset + i,
                        state: EmbeddingState::Embedded,
                        vector: Some(vector),
                        error: None,
                    }));
                }
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    debug!(provider = self.provider.name(), batch = batch_number, %error, "batch failed, embedding members individually");
                    for (i, text) in batch.iter().enumerate() {
                        outcomes.push(self.embed_single_outcome(offset + i, text, cancel).await?);
                    }
                }
            }
        }
        Ok(outcomes)
    }

    async fn embed_single_outcome(
        &self,
        position: usize,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingOutcome, ProviderError> {
        match self.embed(text, cancel).await {
            Ok(vector) => Ok(EmbeddingOutcome {
                position,
                state: EmbeddingState::Embedded,
                vector: Some(vector),
                error: None,
            }),
            Err(error) if error.is_cancelled() => Err(error),
            Err(error) => {
                warn!(provider = self.provider.name(), position, %error, "chunk embedding failed");
                Ok(EmbeddingOutcome {
                    position,
                    state: EmbeddingState::Failed,
                    vector: None,
                    error: Some(error),
                })
            }
        }
    }

    fn validate(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<(), ProviderError> {
        let name = self.provider.name();
        if vectors.len() != expected {
            return Err(ProviderError::new(
                name,
                ProviderFailure::MalformedResponse,
                format!("expected {expected} embeddings, got {}", vectors.len()),
            ));
        }
        let dimensions = self.provider.dimensions();
        for vector in vectors {
            if vector.len() != dimensions {
                return Err(ProviderError::new(
                    name,
                    ProviderFailure::MalformedResponse,
                    format!("embedding dimension {} != {dimensions}", vector.len()),
                ));
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(ProviderError::new(
                    name,
                    ProviderFailure::MalformedResponse,
                    "embedding contains non-finite values",
                ));
            }
        }
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a < f64::EPSILON || norm_b < f64::EPSILON {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails any batch containing the poisoned text.
    struct PoisonedEmbedder {
        poison: String,
    }

    #[async_trait]
    impl EmbeddingProvider for PoisonedEmbedder {
        fn name(&self) -> &str {
            "poisoned"
        }

        fn model(&self) -> &str {
            "test"
        }

        fn dimensions(&self) -> usize {
            8
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            if texts.iter().any(|text| text == &self.poison) {
                return Err(ProviderError::new("poisoned", ProviderFailure::Unavailable, "boom"));
            }
            Ok(texts.iter().map(|_| vec![0.5; 8]).collect())
        }
    }

    #[test]
    fn ngram_embedder_is_deterministic() {
        let embedder = NgramEmbedder::default();
        let first = embedder.embed_one("Hydraulic pressure and flow");
        let second = embedder.embed_one("Hydraulic pressure and flow");
        assert_eq!(first, second);
        assert_eq!(first.len(), DEFAULT_EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let vector = NgramEmbedder { dimensions: 32 }.embed_one("abc def");
        assert!((cosine_similarity(&vector, &vector) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn embedding_space_names_provider_model_and_dims() {
        assert_eq!(NgramEmbedder { dimensions: 64 }.embedding_space(), "ngram:char-trigram:64");
    }

    #[tokio::test]
    async fn tolerant_embedding_isolates_failed_chunk() {
        let generator = EmbeddingGenerator::new(
            Arc::new(PoisonedEmbedder {
                poison: "chunk 2".to_string(),
            }),
            Duration::from_secs(5),
            16,
        );
        let texts: Vec<String> = (0..5).map(|i| format!("chunk {i}")).collect();
        let outcomes = generator
            .embed_tolerant(&texts, &CancellationToken::new())
            .await
            .expect("partial failure is not an error");

        let states: Vec<EmbeddingState> = outcomes.iter().map(|outcome| outcome.state).collect();
        assert_eq!(
            states,
            vec![
                EmbeddingState::Embedded,
                EmbeddingState::Embedded,
                EmbeddingState::Failed,
                EmbeddingState::Embedded,
                EmbeddingState::Embedded,
            ]
        );
        let positions: Vec<usize> = outcomes.iter().map(|outcome| outcome.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
        assert!(outcomes[2].error.is_some());
    }

    #[tokio::test]
    async fn batch_failure_fails_whole_batch() {
        let generator = EmbeddingGenerator::new(
            Arc::new(PoisonedEmbedder {
                poison: "b".to_string(),
            }),
            Duration::from_secs(5),
            16,
        );
        let texts = vec!["a".to_string(), "b".to_string()];
        let error = generator
            .embed_batch(&texts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.provider, "poisoned");
    }

    #[tokio::test]
    async fn wrong_dimensions_are_malformed() {
        let generator = EmbeddingGenerator::new(Arc::new(NgramEmbedder { dimensions: 4 }), Duration::from_secs(5), 4);
        let vector = generator
            .embed("ok", &CancellationToken::new())
            .await
            .expect("ngram embedding should work");
        assert_eq!(vector.len(), 4);
        assert!(generator.validate(1, &[vec![1.0; 3]]).is_err());
        assert!(generator.validate(2, &[vec![1.0; 4]]).is_err());
        assert!(generator.validate(1, &[vec![f32::NAN; 4]]).is_err());
    }

    #[tokio::test]
    async fn openai_embeddings_are_reordered_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/v1/", server.uri())).expect("mock url");
        let embedder = OpenAiEmbedder::new(base, Some("key".to_string()), None, Some(2));
        let vectors = embedder
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .expect("mocked embeddings should decode");
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn openai_requests_configured_dimensions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(serde_json::json!({
                "model": "text-embedding-3-large",
                "dimensions": 3
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/v1/", server.uri())).expect("mock url");
        let embedder = OpenAiEmbedder::new(base, None, Some("text-embedding-3-large".to_string()), Some(3));
        let generator = EmbeddingGenerator::new(Arc::new(embedder), Duration::from_secs(5), 4);
        let vector = generator
            .embed("text", &CancellationToken::new())
            .await
            .expect("shortened vector matches the configured width");
        assert_eq!(vector.len(), 3);
        assert_eq!(generator.embedding_space(), "openai:text-embedding-3-large:3");
    }

    #[test]
    fn known_models_use_their_native_width() {
        assert_eq!(native_dimensions("text-embedding-3-large"), 3072);
        assert_eq!(native_dimensions("mxbai-embed-large:latest"), 1024);
        assert_eq!(native_dimensions("nomic-embed-text"), 768);
    }

    #[tokio::test]
    async fn ollama_embeddings_decode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"embeddings": [[0.1, 0.2, 0.3]]})),
            )
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/", server.uri())).expect("mock url");
        let embedder = OllamaEmbedder::new(base, None, Some(3));
        let vectors = embedder
            .embed_batch(&["text".to_string()])
            .await
            .expect("mocked embeddings should decode");
        assert_eq!(vectors.len(), 1);
        assert_eq!(embedder.embedding_space(), "ollama:nomic-embed-text:3");
    }
}

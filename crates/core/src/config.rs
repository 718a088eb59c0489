use crate::chunking::ChunkingConfig;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.5;
pub const DEFAULT_TOP_K: usize = 4;

/// Process-level defaults. Every field can be overridden per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub default_ocr_provider: Option<String>,
    /// Tried in order when a request names no OCR provider.
    pub ocr_provider_order: Vec<String>,
    pub default_embedding_provider: String,
    pub default_generation_provider: String,
    pub fallback_generation_provider: Option<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub similarity_threshold: f64,
    pub top_k: usize,
    pub embedding_batch_size: usize,
    pub ocr_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
    pub generation_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_ocr_provider: None,
            ocr_provider_order: vec![
                "plain-text".to_string(),
                "pdf-text".to_string(),
                "paddleocr".to_string(),
                "easyocr".to_string(),
                "dots-ocr".to_string(),
                "deepseek-ocr".to_string(),
            ],
            default_embedding_provider: "ngram".to_string(),
            default_generation_provider: "openai".to_string(),
            fallback_generation_provider: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            embedding_batch_size: 16,
            ocr_timeout_secs: 180,
            embedding_timeout_secs: 30,
            generation_timeout_secs: 60,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        validate_chunking(self.chunk_size, self.chunk_overlap)?;
        validate_retrieval(self.top_k, self.similarity_threshold)?;
        if self.embedding_batch_size == 0 {
            return Err(PipelineError::InvalidRequest(
                "embedding batch size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

/// Per-request overrides of [`PipelineConfig`] defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    pub ocr_provider: Option<String>,
    pub embedding_provider: Option<String>,
    pub generation_provider: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f64>,
}

/// Defaults merged with a request's overrides, validated once.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveParams {
    pub ocr_provider: Option<String>,
    pub embedding_provider: String,
    pub generation_provider: String,
    pub chunking: ChunkingConfig,
    pub top_k: usize,
    pub similarity_threshold: f64,
}

impl PipelineConfig {
    pub fn effective(&self, overrides: &Overrides) -> Result<EffectiveParams, PipelineError> {
        let chunking = ChunkingConfig::new(
            overrides.chunk_size.unwrap_or(self.chunk_size),
            overrides.chunk_overlap.unwrap_or(self.chunk_overlap),
        )?;
        let top_k = overrides.top_k.unwrap_or(self.top_k);
        let similarity_threshold = overrides
            .similarity_threshold
            .unwrap_or(self.similarity_threshold);
        validate_retrieval(top_k, similarity_threshold)?;

        Ok(EffectiveParams {
            ocr_provider: overrides
                .ocr_provider
                .clone()
                .or_else(|| self.default_ocr_provider.clone()),
            embedding_provider: overrides
                .embedding_provider
                .clone()
                .unwrap_or_else(|| self.default_embedding_provider.clone()),
            generation_provider: overrides
                .generation_provider
                .clone()
                .unwrap_or_else(|| self.default_generation_provider.clone()),
            chunking,
            top_k,
            similarity_threshold,
        })
    }
}

pub fn validate_chunking(size: usize, overlap: usize) -> Result<(), PipelineError> {
    if size == 0 {
        return Err(PipelineError::InvalidChunkConfig(
            "chunk size must be > 0".to_string(),
        ));
    }
    if overlap >= size {
        return Err(PipelineError::InvalidChunkConfig(format!(
            "overlap {overlap} must be smaller than chunk size {size}"
        )));
    }
    Ok(())
}

pub fn validate_retrieval(top_k: usize, threshold: f64) -> Result<(), PipelineError> {
    if top_k == 0 {
        return Err(PipelineError::InvalidRequest("topK must be >= 1".to_string()));
    }
    if !(0.0..=1.0).contains(&threshold) {
        return Err(PipelineError::InvalidRequest(format!(
            "similarityThreshold {threshold} must be within [0, 1]"
        )));
    }
    Ok(())
}

/// Connection details for a vendor reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl EndpointSettings {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Parsed base URL, or `None` when the vendor is not configured.
    pub fn base_url(&self) -> Result<Option<Url>, PipelineError> {
        let Some(raw) = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Ok(None);
        };
        let mut url = Url::parse(raw)
            .map_err(|error| PipelineError::InvalidRequest(format!("bad endpoint {raw}: {error}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Some(url))
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Endpoints and credentials for every vendor integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProviderSettings {
    pub paddleocr: EndpointSettings,
    pub easyocr: EndpointSettings,
    pub dots_ocr: EndpointSettings,
    pub deepseek_ocr: EndpointSettings,
    pub openai: EndpointSettings,
    pub ollama: EndpointSettings,
    pub anthropic: EndpointSettings,
    pub ngram_dimensions: Option<usize>,
    /// Embedding model for OpenAI; `openai.model` is used when it names an embedding model.
    pub openai_embedding_model: Option<String>,
    /// Requested vector width; the model's native width when unset.
    pub openai_embedding_dimensions: Option<usize>,
    /// Embedding model for Ollama; `ollama.model` is used when it names an embedding model.
    pub ollama_embedding_model: Option<String>,
    pub ollama_embedding_dimensions: Option<usize>,
}

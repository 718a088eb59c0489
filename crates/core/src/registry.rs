use crate::config::{EndpointSettings, PipelineConfig, ProviderSettings};
use crate::embeddings::{
    EmbeddingProvider, NgramEmbedder, OllamaEmbedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
use crate::error::PipelineError;
use crate::extractor::{
    DeepSeekOcrProvider, OcrProvider, OcrServiceProvider, PdfTextProvider, PlainTextProvider, TextExtractor,
};
use crate::generation::{AnthropicGenerator, GenerationProvider, OllamaGenerator, OpenAiGenerator};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

const OPENAI_BASE: &str = "https://api.openai.com/v1/";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com/";

/// Every provider the deployment can reach, keyed by the name requests use.
pub struct ProviderRegistry {
    extractor: TextExtractor,
    embedders: BTreeMap<String, Arc<dyn EmbeddingProvider>>,
    generators: BTreeMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    /// Registry holding only the local providers (`plain-text`, `pdf-text`, `ngram`).
    pub fn local(config: &PipelineConfig) -> Self {
        let mut registry = Self::with_ocr(config, Vec::new());
        registry.add_embedder(Arc::new(NgramEmbedder::default()));
        registry
    }

    fn with_ocr(config: &PipelineConfig, remote: Vec<Arc<dyn OcrProvider>>) -> Self {
        let mut ocr: Vec<Arc<dyn OcrProvider>> = vec![
            Arc::new(PlainTextProvider::default()),
            Arc::new(PdfTextProvider::default()),
        ];
        ocr.extend(remote);

        let mut order = config.ocr_provider_order.clone();
        if let Some(preferred) = &config.default_ocr_provider {
            order.retain(|name| name != preferred);
            order.insert(0, preferred.clone());
        }

        Self {
            extractor: TextExtractor::new(ocr, order, config.ocr_timeout()),
            embedders: BTreeMap::new(),
            generators: BTreeMap::new(),
        }
    }

    /// Registers local providers plus every remote vendor that has enough
    /// settings to be reached.
    pub fn from_settings(config: &PipelineConfig, settings: &ProviderSettings) -> Result<Self, PipelineError> {
        let mut remote_ocr: Vec<Arc<dyn OcrProvider>> = Vec::new();
        if let Some(url) = settings.paddleocr.base_url()? {
            remote_ocr.push(Arc::new(OcrServiceProvider::paddleocr(url, owned_key(&settings.paddleocr))));
        }
        if let Some(url) = settings.easyocr.base_url()? {
            remote_ocr.push(Arc::new(OcrServiceProvider::easyocr(url, owned_key(&settings.easyocr))));
        }
        if let Some(url) = settings.dots_ocr.base_url()? {
            remote_ocr.push(Arc::new(OcrServiceProvider::dots_ocr(url, owned_key(&settings.dots_ocr))));
        }
        if let Some(url) = settings.deepseek_ocr.base_url()? {
            remote_ocr.push(Arc::new(DeepSeekOcrProvider::new(url)));
        }

        let mut registry = Self::with_ocr(config, remote_ocr);
        registry.add_embedder(Arc::new(NgramEmbedder {
            dimensions: settings.ngram_dimensions.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
        }));

        let openai = &settings.openai;
        if openai.api_key().is_some() || openai.endpoint.is_some() {
            let url = base_or(openai, OPENAI_BASE)?;
            registry.add_embedder(Arc::new(OpenAiEmbedder::new(
                url.clone(),
                owned_key(openai),
                settings
                    .openai_embedding_model
                    .clone()
                    .or_else(|| openai.model.clone().filter(|model| model.contains("embedding"))),
                settings.openai_embedding_dimensions,
            )));
            registry.add_generator(Arc::new(OpenAiGenerator::new(
                url,
                owned_key(openai),
                openai.model.clone().filter(|model| !model.contains("embedding")),
            )));
        }

        if let Some(url) = settings.ollama.base_url()? {
            registry.add_embedder(Arc::new(OllamaEmbedder::new(
                url.clone(),
                settings
                    .ollama_embedding_model
                    .clone()
                    .or_else(|| settings.ollama.model.clone().filter(|model| model.contains("embed"))),
                settings.ollama_embedding_dimensions,
            )));
            registry.add_generator(Arc::new(OllamaGenerator::new(url, settings.ollama.model.clone())));
        }

        let anthropic = &settings.anthropic;
        if anthropic.api_key().is_some() {
            registry.add_generator(Arc::new(AnthropicGenerator::new(
                base_or(anthropic, ANTHROPIC_BASE)?,
                owned_key(anthropic),
                anthropic.model.clone(),
            )));
        }

        debug!(
            ocr = ?registry.extractor.provider_names(),
            embedders = ?registry.embedders.keys().collect::<Vec<_>>(),
            generators = ?registry.generators.keys().collect::<Vec<_>>(),
            "provider registry ready"
        );
        Ok(registry)
    }

    pub fn add_embedder(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.embedders.insert(provider.name().to_string(), provider);
    }

    pub fn add_generator(&mut self, provider: Arc<dyn GenerationProvider>) {
        self.generators.insert(provider.name().to_string(), provider);
    }

    pub fn extractor(&self) -> &TextExtractor {
        &self.extractor
    }

    pub fn embedder(&self, name: &str) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
        self.embedders
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownProvider {
                kind: "embedding",
                name: name.to_string(),
            })
    }

    pub fn generator(&self, name: &str) -> Result<Arc<dyn GenerationProvider>, PipelineError> {
        self.generators
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownProvider {
                kind: "generation",
                name: name.to_string(),
            })
    }

    pub fn has_generator(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }
}

fn owned_key(settings: &EndpointSettings) -> Option<String> {
    settings.api_key().map(str::to_string)
}

fn base_or(settings: &EndpointSettings, default: &str) -> Result<Url, PipelineError> {
    match settings.base_url()? {
        Some(url) => Ok(url),
        None => Url::parse(default)
            .map_err(|error| PipelineError::InvalidRequest(format!("bad default endpoint {default}: {error}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_registry_has_offline_providers_only() {
        let registry = ProviderRegistry::local(&PipelineConfig::default());
        assert_eq!(registry.extractor().provider_names(), vec!["plain-text", "pdf-text"]);
        assert!(registry.embedder("ngram").is_ok());
        assert!(matches!(
            registry.generator("openai"),
            Err(PipelineError::UnknownProvider { kind: "generation", .. })
        ));
    }

    #[test]
    fn configured_vendors_are_registered() {
        let settings = ProviderSettings {
            paddleocr: EndpointSettings::with_endpoint("http://ocr.internal:8080"),
            ollama: EndpointSettings::with_endpoint("http://localhost:11434"),
            anthropic: EndpointSettings {
                api_key: Some("key".to_string()),
                ..EndpointSettings::default()
            },
            ..ProviderSettings::default()
        };
        let registry =
            ProviderRegistry::from_settings(&PipelineConfig::default(), &settings).expect("settings are valid");
        assert!(registry.extractor().provider_names().contains(&"paddleocr"));
        assert!(registry.embedder("ollama").is_ok());
        assert!(registry.has_generator("anthropic"));
        assert!(registry.has_generator("ollama"));
        assert!(!registry.has_generator("openai"));
    }

    #[test]
    fn configured_embedding_models_define_the_space() {
        let settings = ProviderSettings {
            openai: EndpointSettings {
                api_key: Some("key".to_string()),
                model: Some("text-embedding-3-large".to_string()),
                ..EndpointSettings::default()
            },
            ollama: EndpointSettings {
                endpoint: Some("http://localhost:11434".to_string()),
                model: Some("llama3".to_string()),
                ..EndpointSettings::default()
            },
            ollama_embedding_model: Some("mxbai-embed-large".to_string()),
            ..ProviderSettings::default()
        };
        let registry =
            ProviderRegistry::from_settings(&PipelineConfig::default(), &settings).expect("settings are valid");
        assert_eq!(
            registry.embedder("openai").expect("openai").embedding_space(),
            "openai:text-embedding-3-large:3072"
        );
        assert_eq!(
            registry.embedder("ollama").expect("ollama").embedding_space(),
            "ollama:mxbai-embed-large:1024"
        );

        let shortened = ProviderSettings {
            openai_embedding_dimensions: Some(256),
            ollama_embedding_dimensions: Some(512),
            ..settings
        };
        let registry =
            ProviderRegistry::from_settings(&PipelineConfig::default(), &shortened).expect("settings are valid");
        assert_eq!(
            registry.embedder("openai").expect("openai").embedding_space(),
            "openai:text-embedding-3-large:256"
        );
        assert_eq!(
            registry.embedder("ollama").expect("ollama").embedding_space(),
            "ollama:mxbai-embed-large:512"
        );
    }

    #[tokio::test]
    async fn configured_ollama_model_embeds_at_its_width() {
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(serde_json::json!({"model": "mxbai-embed-large"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"embeddings": [vec![0.5f32; 1024]]})),
            )
            .mount(&server)
            .await;

        let settings = ProviderSettings {
            ollama: EndpointSettings {
                endpoint: Some(server.uri()),
                model: Some("mxbai-embed-large".to_string()),
                ..EndpointSettings::default()
            },
            ..ProviderSettings::default()
        };
        let registry =
            ProviderRegistry::from_settings(&PipelineConfig::default(), &settings).expect("settings are valid");
        let generator = crate::embeddings::EmbeddingGenerator::new(
            registry.embedder("ollama").expect("ollama"),
            Duration::from_secs(5),
            4,
        );
        let vector = generator
            .embed("hello", &CancellationToken::new())
            .await
            .expect("1024-wide vector matches the configured model");
        assert_eq!(vector.len(), 1024);
    }

    #[test]
    fn preferred_ocr_provider_is_tried_first() {
        let config = PipelineConfig {
            default_ocr_provider: Some("pdf-text".to_string()),
            ..PipelineConfig::default()
        };
        let registry = ProviderRegistry::local(&config);
        let provider = registry
            .extractor()
            .select(None, "application/pdf")
            .expect("pdf-text accepts pdf");
        assert_eq!(provider.name(), "pdf-text");
    }

    #[test]
    fn malformed_endpoint_is_rejected() {
        let settings = ProviderSettings {
            easyocr: EndpointSettings::with_endpoint("not a url"),
            ..ProviderSettings::default()
        };
        assert!(matches!(
            ProviderRegistry::from_settings(&PipelineConfig::default(), &settings),
            Err(PipelineError::InvalidRequest(_))
        ));
    }
}

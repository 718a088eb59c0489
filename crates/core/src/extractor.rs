use crate::error::{PipelineError, ProviderError, ProviderFailure};
use crate::http::{guarded, send_json};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document as PdfDocument;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const MIB: usize = 1024 * 1024;

/// What a provider hands back before the extractor normalises it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExtraction {
    pub text: String,
    /// In [0, 1].
    pub confidence: Option<f32>,
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub text: String,
    pub confidence: Option<f32>,
    pub page_count: Option<u32>,
    pub provider_used: String,
    /// Nothing text-bearing was found; callers skip indexing instead of failing.
    pub empty: bool,
}

impl Extraction {
    fn empty(provider_used: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: None,
            page_count: None,
            provider_used: provider_used.into(),
            empty: true,
        }
    }
}

/// Request size, page and content-type limits a provider enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLimits {
    pub max_bytes: usize,
    pub max_pages: Option<u32>,
    /// Exact types, or prefixes ending in `/` such as `image/`.
    pub content_types: Vec<&'static str>,
}

impl ProviderLimits {
    pub fn accepts(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.content_types.iter().any(|accepted| {
            if accepted.ends_with('/') {
                essence.starts_with(accepted)
            } else {
                essence == *accepted
            }
        })
    }

    async fn check(&self, provider: &str, bytes: &[u8], content_type: &str) -> Result<(), ProviderError> {
        if !self.accepts(content_type) {
            return Err(ProviderError::new(
                provider,
                ProviderFailure::UnsupportedContent,
                format!("content type {content_type} is not supported"),
            ));
        }
        if bytes.len() > self.max_bytes {
            return Err(ProviderError::new(
                provider,
                ProviderFailure::PayloadTooLarge,
                format!("{} bytes exceeds the {} byte limit", bytes.len(), self.max_bytes),
            ));
        }
        if let Some(max_pages) = self.max_pages {
            if let Some(pages) = pdf_page_count(provider, bytes, content_type).await? {
                if pages > max_pages {
                    return Err(ProviderError::new(
                        provider,
                        ProviderFailure::PageLimitExceeded,
                        format!("{pages} pages exceeds the {max_pages} page limit"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> &ProviderLimits;

    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<RawExtraction, ProviderError>;
}

/// Runs one OCR provider per call. Failures are surfaced, never retried on
/// another provider: that choice belongs to the caller.
pub struct TextExtractor {
    providers: Vec<Arc<dyn OcrProvider>>,
    default_order: Vec<String>,
    timeout: Duration,
}

impl TextExtractor {
    pub fn new(providers: Vec<Arc<dyn OcrProvider>>, default_order: Vec<String>, timeout: Duration) -> Self {
        Self {
            providers,
            default_order,
            timeout,
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|provider| provider.name()).collect()
    }

    /// Explicit hint first; otherwise the first provider in the default order
    /// that accepts the content type.
    pub fn select(&self, hint: Option<&str>, content_type: &str) -> Result<Arc<dyn OcrProvider>, PipelineError> {
        if let Some(name) = hint {
            return self
                .find(name)
                .ok_or_else(|| PipelineError::UnknownProvider {
                    kind: "ocr",
                    name: name.to_string(),
                });
        }

        self.default_order
            .iter()
            .filter_map(|name| self.find(name))
            .find(|provider| provider.limits().accepts(content_type))
            .ok_or_else(|| {
                PipelineError::InvalidRequest(format!("no configured OCR provider accepts {content_type}"))
            })
    }

    fn find(&self, name: &str) -> Option<Arc<dyn OcrProvider>> {
        self.providers
            .iter()
            .find(|provider| provider.name() == name)
            .cloned()
    }

    pub async fn extract(
        &self,
        bytes: &[u8],
        content_type: &str,
        hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Extraction, PipelineError> {
        if bytes.is_empty() {
            debug!(content_type, "zero-length input, skipping providers");
            return Ok(Extraction::empty(hint.unwrap_or("none")));
        }
        let provider = self.select(hint, content_type)?;
        self.extract_with(provider.as_ref(), bytes, content_type, cancel)
            .await
            .map_err(|error| PipelineError::stage(crate::error::Stage::Extraction, None, error))
    }

    pub async fn extract_with(
        &self,
        provider: &dyn OcrProvider,
        bytes: &[u8],
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Extraction, ProviderError> {
        let name = provider.name();
        if bytes.is_empty() {
            return Ok(Extraction::empty(name));
        }
        provider.limits().check(name, bytes, content_type).await?;

        let started = Instant::now();
        let raw = guarded(name, self.timeout, cancel, provider.extract(bytes, content_type))
            .await
            .inspect_err(|error| warn!(provider = name, kind = %error.kind, "extraction failed"))?;

        let text = raw.text.trim().to_string();
        info!(
            provider = name,
            chars = text.len(),
            pages = ?raw.page_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction finished"
        );

        if text.is_empty() {
            return Ok(Extraction {
                page_count: raw.page_count,
                ..Extraction::empty(name)
            });
        }

        Ok(Extraction {
            text,
            confidence: raw.confidence.map(|value| value.clamp(0.0, 1.0)),
            page_count: raw.page_count,
            provider_used: name.to_string(),
            empty: false,
        })
    }
}

/// Page count of a parseable PDF; `None` for other content or unreadable files.
async fn pdf_page_count(provider: &str, bytes: &[u8], content_type: &str) -> Result<Option<u32>, ProviderError> {
    if !content_type.to_ascii_lowercase().contains("pdf") {
        return Ok(None);
    }
    let owned = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        PdfDocument::load_mem(&owned)
            .ok()
            .map(|document| document.get_pages().len() as u32)
    })
    .await
    .map_err(|error| ProviderError::new(provider, ProviderFailure::Unavailable, error.to_string()))
}

/// Reads text-like uploads as UTF-8.
pub struct PlainTextProvider {
    limits: ProviderLimits,
}

impl Default for PlainTextProvider {
    fn default() -> Self {
        Self {
            limits: ProviderLimits {
                max_bytes: 50 * MIB,
                max_pages: None,
                content_types: vec![
                    "text/",
                    "application/json",
                    "application/xml",
                    "application/markdown",
                ],
            },
        }
    }
}

#[async_trait]
impl OcrProvider for PlainTextProvider {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    async fn extract(&self, bytes: &[u8], _content_type: &str) -> Result<RawExtraction, ProviderError> {
        Ok(RawExtraction {
            text: String::from_utf8_lossy(bytes).into_owned(),
            confidence: Some(1.0),
            page_count: None,
        })
    }
}

/// Pulls the embedded text layer out of a PDF. Scanned PDFs need an OCR provider.
pub struct PdfTextProvider {
    limits: ProviderLimits,
}

impl Default for PdfTextProvider {
    fn default() -> Self {
        Self {
            limits: ProviderLimits {
                max_bytes: 100 * MIB,
                max_pages: None,
                content_types: vec!["application/pdf"],
            },
        }
    }
}

#[async_trait]
impl OcrProvider for PdfTextProvider {
    fn name(&self) -> &str {
        "pdf-text"
    }

    fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    async fn extract(&self, bytes: &[u8], _content_type: &str) -> Result<RawExtraction, ProviderError> {
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_pdf_text_layer(&owned))
            .await
            .map_err(|error| ProviderError::new("pdf-text", ProviderFailure::Unavailable, error.to_string()))?
    }
}

fn extract_pdf_text_layer(bytes: &[u8]) -> Result<RawExtraction, ProviderError> {
    let document = PdfDocument::load_mem(bytes).map_err(|error| {
        ProviderError::new("pdf-text", ProviderFailure::Rejected, format!("pdf parse error: {error}"))
    })?;

    let pages = document.get_pages();
    let mut sections = Vec::new();
    for page_no in pages.keys() {
        let text = document.extract_text(&[*page_no]).map_err(|error| {
            ProviderError::new("pdf-text", ProviderFailure::Rejected, format!("page {page_no}: {error}"))
        })?;
        if !text.trim().is_empty() {
            sections.push(format!("--- Page {page_no} ---\n{}", text.trim()));
        }
    }

    if sections.is_empty() && !pages.is_empty() {
        return Err(ProviderError::new(
            "pdf-text",
            ProviderFailure::UnsupportedContent,
            "pdf has no text layer; use an OCR provider",
        ));
    }

    Ok(RawExtraction {
        text: sections.join("\n\n"),
        confidence: Some(1.0),
        page_count: Some(pages.len() as u32),
    })
}

#[derive(Debug, Serialize)]
struct OcrServiceRequest<'a> {
    base64_data: String,
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct OcrServiceResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: Option<OcrServiceMetadata>,
}

#[derive(Debug, Deserialize)]
struct OcrServiceMetadata {
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    pages: Option<u32>,
}

fn default_success() -> bool {
    true
}

/// Vendor OCR services that take base64 JSON at `POST {endpoint}/ocr`
/// (PaddleOCR, EasyOCR, dots.ocr deployments).
pub struct OcrServiceProvider {
    name: String,
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    limits: ProviderLimits,
}

impl OcrServiceProvider {
    pub fn new(name: impl Into<String>, base_url: Url, api_key: Option<String>, limits: ProviderLimits) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            base_url,
            api_key,
            limits,
        }
    }

    pub fn paddleocr(base_url: Url, api_key: Option<String>) -> Self {
        Self::new("paddleocr", base_url, api_key, document_limits(20 * MIB, 50))
    }

    pub fn easyocr(base_url: Url, api_key: Option<String>) -> Self {
        Self::new("easyocr", base_url, api_key, document_limits(10 * MIB, 20))
    }

    pub fn dots_ocr(base_url: Url, api_key: Option<String>) -> Self {
        Self::new("dots-ocr", base_url, api_key, document_limits(20 * MIB, 30))
    }
}

fn document_limits(max_bytes: usize, max_pages: u32) -> ProviderLimits {
    ProviderLimits {
        max_bytes,
        max_pages: Some(max_pages),
        content_types: vec!["application/pdf", "image/"],
    }
}

/// Services report confidence either in [0, 1] or as a percentage.
fn unit_confidence(value: f32) -> f32 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

#[async_trait]
impl OcrProvider for OcrServiceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<RawExtraction, ProviderError> {
        let url = self
            .base_url
            .join("ocr")
            .map_err(|error| ProviderError::new(&self.name, ProviderFailure::NotConfigured, error.to_string()))?;
        let payload = OcrServiceRequest {
            base64_data: STANDARD.encode(bytes),
            content_type,
        };

        let mut request = self.client.post(url).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response: OcrServiceResponse = send_json(&self.name, request).await?;
        if !response.success {
            return Err(ProviderError::new(
                &self.name,
                ProviderFailure::Rejected,
                response.error.unwrap_or_else(|| "service reported failure".to_string()),
            ));
        }

        let metadata = response.metadata;
        Ok(RawExtraction {
            text: response.text.unwrap_or_default(),
            confidence: metadata
                .as_ref()
                .and_then(|meta| meta.confidence)
                .map(unit_confidence),
            page_count: metadata.and_then(|meta| meta.pages),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DeepSeekResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// DeepSeek-OCR takes a single image as a multipart upload at `POST {endpoint}/api/ocr`.
pub struct DeepSeekOcrProvider {
    client: Client,
    base_url: Url,
    limits: ProviderLimits,
}

impl DeepSeekOcrProvider {
    const NO_TEXT_SENTINEL: &'static str = "No text returned by model.";

    pub fn new(base_url: Url) -> Self {
        Self {
            client: Client::new(),
            base_url,
            limits: ProviderLimits {
                max_bytes: 10 * MIB,
                max_pages: Some(1),
                content_types: vec!["image/"],
            },
        }
    }
}

#[async_trait]
impl OcrProvider for DeepSeekOcrProvider {
    fn name(&self) -> &str {
        "deepseek-ocr"
    }

    fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<RawExtraction, ProviderError> {
        let name = self.name();
        let url = self
            .base_url
            .join("api/ocr")
            .map_err(|error| ProviderError::new(name, ProviderFailure::NotConfigured, error.to_string()))?;
        let part = Part::bytes(bytes.to_vec())
            .file_name("upload")
            .mime_str(content_type)
            .map_err(|error| ProviderError::new(name, ProviderFailure::UnsupportedContent, error.to_string()))?;
        let form = Form::new().part("image", part).text("mode", "plain_ocr");

        let response: DeepSeekResponse = send_json(name, self.client.post(url).multipart(form)).await?;
        if !response.success {
            return Err(ProviderError::new(
                name,
                ProviderFailure::Rejected,
                response.detail.unwrap_or_else(|| "service reported failure".to_string()),
            ));
        }

        let text = response
            .text
            .filter(|text| text.trim() != Self::NO_TEXT_SENTINEL)
            .unwrap_or_default();
        Ok(RawExtraction {
            text,
            confidence: None,
            page_count: Some(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_extractor() -> TextExtractor {
        TextExtractor::new(
            vec![Arc::new(PlainTextProvider::default()), Arc::new(PdfTextProvider::default())],
            vec!["plain-text".to_string(), "pdf-text".to_string()],
            Duration::from_secs(5),
        )
    }

    #[test]
    fn limits_match_prefixes_and_parameters() {
        let limits = document_limits(10, 1);
        assert!(limits.accepts("image/png"));
        assert!(limits.accepts("Application/PDF; charset=binary"));
        assert!(!limits.accepts("text/plain"));
    }

    #[test]
    fn percentage_confidence_is_scaled() {
        assert!((unit_confidence(97.5) - 0.975).abs() < 1e-6);
        assert!((unit_confidence(0.8) - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn zero_length_input_is_empty_extraction() {
        let extraction = local_extractor()
            .extract(&[], "application/pdf", None, &CancellationToken::new())
            .await
            .expect("empty input is not an error");
        assert!(extraction.empty);
        assert_eq!(extraction.text, "");
    }

    #[tokio::test]
    async fn default_order_picks_first_accepting_provider() {
        let extractor = local_extractor();
        let provider = extractor.select(None, "text/markdown").expect("plain text accepts markdown");
        assert_eq!(provider.name(), "plain-text");
        let provider = extractor.select(None, "application/pdf").expect("pdf-text accepts pdf");
        assert_eq!(provider.name(), "pdf-text");
        assert!(extractor.select(None, "video/mp4").is_err());
    }

    #[tokio::test]
    async fn unknown_hint_is_rejected() {
        let result = local_extractor().select(Some("tesseract"), "image/png");
        assert!(matches!(result, Err(PipelineError::UnknownProvider { .. })));
    }

    #[tokio::test]
    async fn hinted_provider_with_wrong_content_type_surfaces_provider_error() {
        let error = local_extractor()
            .extract(b"hello", "image/png", Some("plain-text"), &CancellationToken::new())
            .await
            .unwrap_err();
        match error {
            PipelineError::Stage { source, .. } => {
                assert_eq!(source.provider, "plain-text");
                assert_eq!(source.kind, ProviderFailure::UnsupportedContent);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn whitespace_only_text_is_empty_extraction() {
        let extraction = local_extractor()
            .extract(b" \n\t ", "text/plain", None, &CancellationToken::new())
            .await
            .expect("blank text is not an error");
        assert!(extraction.empty);
        assert_eq!(extraction.provider_used, "plain-text");
    }

    #[tokio::test]
    async fn garbage_pdf_is_rejected_by_text_layer_provider() {
        let error = local_extractor()
            .extract(b"%PDF-1.4\n%broken", "application/pdf", Some("pdf-text"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Stage { .. }));
    }

    #[tokio::test]
    async fn ocr_service_response_is_normalised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .and(body_partial_json(serde_json::json!({"content_type": "image/png"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "text": "  Invoice total: 42 EUR \n",
                "metadata": {"provider": "paddleocr", "confidence": 91.0, "pages": 1}
            })))
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/", server.uri())).expect("mock url");
        let provider = OcrServiceProvider::paddleocr(base, None);
        let extractor = TextExtractor::new(vec![Arc::new(provider)], Vec::new(), Duration::from_secs(5));
        let extraction = extractor
            .extract(b"\x89PNG fake", "image/png", Some("paddleocr"), &CancellationToken::new())
            .await
            .expect("mocked OCR should succeed");

        assert_eq!(extraction.text, "Invoice total: 42 EUR");
        assert_eq!(extraction.provider_used, "paddleocr");
        assert_eq!(extraction.page_count, Some(1));
        assert!((extraction.confidence.unwrap_or_default() - 0.91).abs() < 1e-6);
    }

    #[tokio::test]
    async fn service_failure_body_is_rejected_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "error": "No base64 data provided"
            })))
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/", server.uri())).expect("mock url");
        let provider = OcrServiceProvider::dots_ocr(base, None);
        let error = provider.extract(b"data", "image/png").await.unwrap_err();
        assert_eq!(error.kind, ProviderFailure::Rejected);
        assert_eq!(error.message, "No base64 data provided");
    }

    #[tokio::test]
    async fn oversized_payload_fails_before_network() {
        let base = Url::parse("http://127.0.0.1:9/").expect("static url");
        let provider = DeepSeekOcrProvider::new(base);
        let extractor = TextExtractor::new(vec![Arc::new(provider)], Vec::new(), Duration::from_secs(5));
        let bytes = vec![0u8; 10 * MIB + 1];
        let error = extractor
            .extract_with(
                extractor.select(Some("deepseek-ocr"), "image/png").expect("registered").as_ref(),
                &bytes,
                "image/png",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind, ProviderFailure::PayloadTooLarge);
    }

    fn blank_pdf(page_count: usize) -> Vec<u8> {
        use lopdf::{dictionary, Document, Object};

        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let kids: Vec<Object> = (0..page_count)
            .map(|_| {
                document
                    .add_object(dictionary! {
                        "Type" => "Page",
                        "Parent" => pages_id,
                        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                    })
                    .into()
            })
            .collect();
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        document.save_to(&mut bytes).expect("in-memory pdf");
        bytes
    }

    #[tokio::test]
    async fn page_limit_fails_before_network() {
        let base = Url::parse("http://127.0.0.1:9/").expect("static url");
        let provider = OcrServiceProvider::new("tiny-ocr", base, None, document_limits(MIB, 1));
        let extractor = TextExtractor::new(vec![Arc::new(provider)], Vec::new(), Duration::from_secs(5));
        let selected = extractor
            .select(Some("tiny-ocr"), "application/pdf")
            .expect("registered");
        let error = extractor
            .extract_with(selected.as_ref(), &blank_pdf(2), "application/pdf", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.kind, ProviderFailure::PageLimitExceeded);
        assert!(error.message.contains("2 pages"));
    }

    #[tokio::test]
    async fn deepseek_sentinel_means_no_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/ocr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "text": "No text returned by model."
            })))
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/", server.uri())).expect("mock url");
        let extractor = TextExtractor::new(
            vec![Arc::new(DeepSeekOcrProvider::new(base))],
            vec!["deepseek-ocr".to_string()],
            Duration::from_secs(5),
        );
        let extraction = extractor
            .extract(b"blank page", "image/jpeg", None, &CancellationToken::new())
            .await
            .expect("blank scan is not an error");
        assert!(extraction.empty);
        assert_eq!(extraction.provider_used, "deepseek-ocr");
    }
}

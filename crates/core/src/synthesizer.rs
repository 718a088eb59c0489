use crate::error::{PipelineError, ProviderError, Stage};
use crate::generation::{GenerationProvider, Prompt};
use crate::http::guarded;
use crate::models::{AnswerStatus, Citation, RetrievalDiagnostics, RetrievalEmpty, ScoredChunk, SearchOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const NO_RELEVANT_INFORMATION: &str = "No relevant information was found in the indexed documents.";

const SYSTEM_PROMPT: &str = "You answer questions using only the numbered context passages you are given. \
Cite the passages you rely on by their number in square brackets, for example [1]. \
If the passages do not contain the answer, reply that the provided context is insufficient to answer. \
Do not use outside knowledge.";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub text: String,
    /// Retrieval rank order.
    pub citations: Vec<Citation>,
    pub status: AnswerStatus,
    /// `None` when no provider was called.
    pub provider_used: Option<String>,
    pub diagnostics: RetrievalDiagnostics,
}

/// Readable reason for an empty retrieval, naming the parameters used.
pub fn explain_empty(diagnostics: &RetrievalDiagnostics) -> String {
    let filters = if diagnostics.filters_applied.is_empty() {
        "no filters".to_string()
    } else {
        diagnostics.filters_applied.join(", ")
    };
    match diagnostics.empty_reason {
        Some(RetrievalEmpty::FilterMatchedNothing) => {
            format!("No indexed document matches the requested filter ({filters}).")
        }
        Some(RetrievalEmpty::NothingIndexed) => {
            format!("No searchable passages are indexed for this scope ({filters}).")
        }
        Some(RetrievalEmpty::BelowThreshold) => format!(
            "{} passages were compared but none reached the similarity threshold {:.2} ({filters}).",
            diagnostics.chunks_considered, diagnostics.threshold
        ),
        None => String::new(),
    }
}

/// The deterministic answer given when retrieval came back empty.
pub fn no_relevant_information(diagnostics: RetrievalDiagnostics) -> Answer {
    info!(reason = ?diagnostics.empty_reason, "no passage cleared retrieval, skipping generation");
    Answer {
        text: NO_RELEVANT_INFORMATION.to_string(),
        citations: Vec::new(),
        status: AnswerStatus::NoRelevantInformation,
        provider_used: None,
        diagnostics,
    }
}

pub fn build_prompt(question: &str, hits: &[ScoredChunk]) -> Prompt {
    let mut user = String::from("Context passages:\n\n");
    for (position, hit) in hits.iter().enumerate() {
        let source = hit.source_ref.as_deref().unwrap_or(&hit.document_id);
        user.push_str(&format!("[{}] ({source}, chunk {})\n", position + 1, hit.chunk_index));
        user.push_str(&format!("{}\n\n", hit.text.trim()));
    }
    user.push_str(&format!("Question: {}", question.trim()));
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

pub fn citations(hits: &[ScoredChunk]) -> Vec<Citation> {
    hits.iter()
        .map(|hit| Citation {
            chunk_index: hit.chunk_index,
            document_id: hit.document_id.clone(),
            source_ref: hit.source_ref.clone().unwrap_or_else(|| hit.document_id.clone()),
            score: hit.score,
        })
        .collect()
}

pub struct AnswerSynthesizer {
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Answers from the retrieved passages. An empty retrieval never reaches
    /// a provider. A failing primary is retried once on `fallback`.
    pub async fn answer(
        &self,
        question: &str,
        retrieval: SearchOutcome,
        primary: Arc<dyn GenerationProvider>,
        fallback: Option<Arc<dyn GenerationProvider>>,
        cancel: &CancellationToken,
    ) -> Result<Answer, PipelineError> {
        let SearchOutcome { hits, diagnostics } = retrieval;
        if hits.is_empty() {
            return Ok(no_relevant_information(diagnostics));
        }

        let prompt = build_prompt(question, &hits);
        let (text, provider_used) = match self.generate(primary.as_ref(), &prompt, cancel).await {
            Ok(text) => (text, primary.name().to_string()),
            Err(error) if error.is_cancelled() => return Err(PipelineError::Cancelled),
            Err(primary_error) => {
                let Some(fallback) = fallback.filter(|fallback| fallback.name() != primary.name()) else {
                    return Err(PipelineError::stage(Stage::Synthesis, None, primary_error));
                };
                warn!(
                    primary = %primary_error.provider,
                    fallback = fallback.name(),
                    kind = %primary_error.kind,
                    "primary generation provider failed, trying fallback"
                );
                match self.generate(fallback.as_ref(), &prompt, cancel).await {
                    Ok(text) => (text, fallback.name().to_string()),
                    Err(error) if error.is_cancelled() => return Err(PipelineError::Cancelled),
                    Err(fallback_error) => {
                        return Err(PipelineError::ProvidersExhausted {
                            stage: Stage::Synthesis,
                            attempts: vec![primary_error, fallback_error],
                        })
                    }
                }
            }
        };

        Ok(Answer {
            text,
            citations: citations(&hits),
            status: AnswerStatus::Answered,
            provider_used: Some(provider_used),
            diagnostics,
        })
    }

    async fn generate(
        &self,
        provider: &dyn GenerationProvider,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let started = Instant::now();
        let text = guarded(provider.name(), self.timeout, cancel, provider.generate(prompt)).await?;
        info!(
            provider = provider.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answer generated"
        );
        Ok(text)
    }
}

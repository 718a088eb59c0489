use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline stage that talks to an external provider or the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Embedding,
    Retrieval,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Extraction => "extraction",
            Stage::Embedding => "embedding",
            Stage::Retrieval => "retrieval",
            Stage::Synthesis => "synthesis",
        };
        f.write_str(label)
    }
}

/// Why a vendor call did not produce a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFailure {
    RateLimited,
    PayloadTooLarge,
    PageLimitExceeded,
    UnsupportedContent,
    Rejected,
    Unavailable,
    MalformedResponse,
    Timeout,
    Cancelled,
    Transport,
    NotConfigured,
}

impl ProviderFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderFailure::RateLimited => "rate_limited",
            ProviderFailure::PayloadTooLarge => "payload_too_large",
            ProviderFailure::PageLimitExceeded => "page_limit_exceeded",
            ProviderFailure::UnsupportedContent => "unsupported_content",
            ProviderFailure::Rejected => "rejected",
            ProviderFailure::Unavailable => "unavailable",
            ProviderFailure::MalformedResponse => "malformed_response",
            ProviderFailure::Timeout => "timeout",
            ProviderFailure::Cancelled => "cancelled",
            ProviderFailure::Transport => "transport",
            ProviderFailure::NotConfigured => "not_configured",
        }
    }

    /// Maps a non-success HTTP status returned by a vendor.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => ProviderFailure::RateLimited,
            413 => ProviderFailure::PayloadTooLarge,
            code if code >= 500 => ProviderFailure::Unavailable,
            _ => ProviderFailure::Rejected,
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vendor rejected or failed a request. Carries the vendor's own message.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("provider {provider} failed ({kind}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderFailure,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, kind: ProviderFailure, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_reqwest(provider: &str, error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ProviderFailure::Timeout
        } else if error.is_decode() {
            ProviderFailure::MalformedResponse
        } else if let Some(status) = error.status() {
            ProviderFailure::from_status(status)
        } else {
            ProviderFailure::Transport
        };
        Self::new(provider, kind, error.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ProviderFailure::Cancelled
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidJobTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    #[error("job {job_id} no longer owns the chunk set of document {document_id}")]
    Superseded { job_id: Uuid, document_id: String },

    #[error("chunk set rejected: {0}")]
    InvalidChunkSet(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("object storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed{}: {source}", job_suffix(.job_id))]
    Stage {
        stage: Stage,
        job_id: Option<Uuid>,
        #[source]
        source: ProviderError,
    },

    #[error("{stage} stage failed on every provider: {}", describe_attempts(.attempts))]
    ProvidersExhausted {
        stage: Stage,
        attempts: Vec<ProviderError>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown {kind} provider: {name}")]
    UnknownProvider { kind: &'static str, name: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("request cancelled")]
    Cancelled,
}

fn job_suffix(job_id: &Option<Uuid>) -> String {
    job_id
        .map(|id| format!(" for job {id}"))
        .unwrap_or_default()
}

fn describe_attempts(attempts: &[ProviderError]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    pub fn stage(stage: Stage, job_id: Option<Uuid>, source: ProviderError) -> Self {
        if source.is_cancelled() {
            return PipelineError::Cancelled;
        }
        PipelineError::Stage {
            stage,
            job_id,
            source,
        }
    }

    /// Attaches the job a stage failure happened in.
    pub fn for_job(self, job: Uuid) -> Self {
        match self {
            PipelineError::Stage { stage, source, .. } => PipelineError::Stage {
                stage,
                job_id: Some(job),
                source,
            },
            other => other,
        }
    }

    /// Stable machine-readable code for API bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Stage { source, .. } => match source.kind {
                ProviderFailure::Timeout => "provider_timeout",
                ProviderFailure::NotConfigured => "provider_not_configured",
                ProviderFailure::PayloadTooLarge
                | ProviderFailure::PageLimitExceeded
                | ProviderFailure::UnsupportedContent => "provider_limit",
                _ => "provider_error",
            },
            PipelineError::ProvidersExhausted { .. } => "providers_exhausted",
            PipelineError::Store(StoreError::NotFound { .. }) => "not_found",
            PipelineError::Store(StoreError::Superseded { .. }) => "job_superseded",
            PipelineError::Store(StoreError::InvalidJobTransition { .. }) => "invalid_job_state",
            PipelineError::Store(_) => "store_error",
            PipelineError::UnknownProvider { .. } => "unknown_provider",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::InvalidChunkConfig(_) => "invalid_chunk_config",
            PipelineError::Cancelled => "cancelled",
        }
    }

    /// Human-readable explanation for end users. Each failure class reads differently.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Stage {
                stage,
                source,
                ..
            } => format!(
                "Processing failed during {stage}: provider '{}' reported {} ({}).",
                source.provider, source.kind, source.message
            ),
            PipelineError::ProvidersExhausted { stage, attempts } => {
                let names = attempts
                    .iter()
                    .map(|attempt| attempt.provider.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Processing failed during {stage}: every provider tried ({names}) returned an error.")
            }
            PipelineError::Store(StoreError::NotFound { entity, id }) => {
                format!("No {entity} with id '{id}' exists.")
            }
            PipelineError::Store(_) => {
                "The document store is unavailable, so the request could not be completed.".to_string()
            }
            PipelineError::UnknownProvider { kind, name } => {
                format!("'{name}' is not a configured {kind} provider.")
            }
            PipelineError::InvalidRequest(message) | PipelineError::InvalidChunkConfig(message) => {
                format!("The request was invalid: {message}.")
            }
            PipelineError::Cancelled => "The request was cancelled before it finished.".to_string(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

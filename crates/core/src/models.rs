use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    /// Filename or URL the document came from.
    pub source_ref: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Extracting => "extracting",
            JobStatus::Chunking => "chunking",
            JobStatus::Embedding => "embedding",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "extracting" => Some(JobStatus::Extracting),
            "chunking" => Some(JobStatus::Chunking),
            "embedding" => Some(JobStatus::Embedding),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn can_advance_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Pending, Extracting) => true,
            (Extracting, Chunking) => true,
            (Chunking, Embedding) | (Chunking, Completed) => true,
            (Embedding, Completed) => true,
            _ => false,
        }
    }
}

/// One extraction-and-indexing attempt for a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub id: Uuid,
    pub document_id: String,
    pub status: JobStatus,
    pub ocr_provider: Option<String>,
    pub embedding_provider: Option<String>,
    pub error: Option<String>,
    /// Chunk indices whose embedding failed and await a retry.
    pub pending_indices: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    pub fn new(document_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            status: JobStatus::Pending,
            ocr_provider: None,
            embedding_provider: None,
            error: None,
            pending_indices: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), StoreError> {
        if !self.status.can_advance_to(next) {
            return Err(StoreError::InvalidJobTransition {
                job_id: self.id,
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), StoreError> {
        self.advance(JobStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Elapsed wall time, once the job has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.created_at).num_milliseconds())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingState {
    Pending,
    Embedded,
    Failed,
}

impl EmbeddingState {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingState::Pending => "pending",
            EmbeddingState::Embedded => "embedded",
            EmbeddingState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EmbeddingState::Pending),
            "embedded" => Some(EmbeddingState::Embedded),
            "failed" => Some(EmbeddingState::Failed),
            _ => None,
        }
    }
}

/// A chunk as handed to the store by the indexing stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkWrite {
    pub index: u64,
    pub text: String,
    pub page: Option<u32>,
    pub vector: Option<Vec<f32>>,
    pub state: EmbeddingState,
}

/// A persisted chunk.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    pub id: String,
    /// `None` until the owning document row exists.
    pub document_id: Option<String>,
    pub claimed_document_id: String,
    pub job_id: Uuid,
    pub chunk_index: u64,
    pub text: String,
    pub content_hash: String,
    pub page: Option<u32>,
    #[serde(skip)]
    pub vector: Option<Vec<f32>>,
    pub embedding_space: Option<String>,
    pub state: EmbeddingState,
    pub created_at: DateTime<Utc>,
}

/// One ranked hit of a similarity search.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_ref: Option<String>,
    pub chunk_index: u64,
    pub page: Option<u32>,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
    pub document_id: Option<String>,
    pub filename_exact: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.filename_exact.is_none()
    }

    pub fn describe(&self) -> Vec<String> {
        let mut applied = Vec::new();
        if let Some(document_id) = &self.document_id {
            applied.push(format!("documentId={document_id}"));
        }
        if let Some(filename) = &self.filename_exact {
            applied.push(format!("filenameExact={filename}"));
        }
        applied
    }
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub top_k: usize,
    pub threshold: f64,
    pub filter: SearchFilter,
    /// Only chunks embedded in this space are comparable with the query.
    pub embedding_space: String,
}

/// Why a search produced no hits.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalEmpty {
    /// The document/filename filter selected no document at all.
    FilterMatchedNothing,
    /// Documents matched but nothing searchable is indexed for them.
    NothingIndexed,
    /// Chunks were scored but none cleared the threshold.
    BelowThreshold,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalDiagnostics {
    pub threshold: f64,
    pub top_k: usize,
    pub filters_applied: Vec<String>,
    /// Chunks selected by the filter, regardless of embedding state.
    pub chunks_in_scope: usize,
    /// Chunks actually scored against the query vector.
    pub chunks_considered: usize,
    pub chunks_skipped_other_space: usize,
    pub empty_reason: Option<RetrievalEmpty>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub hits: Vec<ScoredChunk>,
    pub diagnostics: RetrievalDiagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub chunk_index: u64,
    pub document_id: String,
    pub source_ref: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    NoRelevantInformation,
}

/// A question/answer pair kept for history; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QaSession {
    pub id: Uuid,
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

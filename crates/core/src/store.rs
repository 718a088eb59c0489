//! Persistence for documents, chunks, jobs and Q&A history, plus the
//! ranking rules every backend shares.

use crate::embeddings::cosine_similarity;
use crate::error::StoreError;
use crate::models::{
    ChunkWrite, Document, EmbeddingState, ProcessingJob, QaSession, RetrievalDiagnostics, RetrievalEmpty,
    ScoredChunk, SearchOutcome, SearchParams, StoredChunk,
};
use async_trait::async_trait;
use std::cmp::Ordering;
use tracing::warn;
use uuid::Uuid;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Inserts or replaces a document and links any chunks written before it existed.
    async fn put_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn find_document_by_source(&self, source_ref: &str) -> Result<Option<Document>, StoreError>;

    /// Removes the document with its chunks and jobs. Returns whether it existed.
    async fn delete_document(&self, id: &str) -> Result<bool, StoreError>;

    async fn create_job(&self, job: &ProcessingJob) -> Result<(), StoreError>;

    /// Terminal jobs keep their status; only their bookkeeping may change.
    async fn update_job(&self, job: &ProcessingJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>, StoreError>;

    /// Atomically replaces the document's chunk set with `job_id`'s set.
    async fn write_chunks(
        &self,
        job_id: Uuid,
        document_id: &str,
        embedding_space: &str,
        chunks: &[ChunkWrite],
    ) -> Result<(), StoreError>;

    /// Completes one pending chunk. Fails with `Superseded` once another job
    /// has replaced the set.
    async fn set_embedding(
        &self,
        job_id: Uuid,
        document_id: &str,
        chunk_index: u64,
        vector: &[f32],
        embedding_space: &str,
    ) -> Result<(), StoreError>;

    /// Chunks in index order.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>, StoreError>;

    /// Side-effect free similarity search.
    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchOutcome, StoreError>;

    async fn record_session(&self, session: &QaSession) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_sessions(&self, limit: usize) -> Result<Vec<QaSession>, StoreError>;
}

/// Sorts a chunk set by index and rejects gaps or duplicates.
pub fn ordered_chunk_set(chunks: &[ChunkWrite]) -> Result<Vec<&ChunkWrite>, StoreError> {
    let mut ordered: Vec<&ChunkWrite> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.index);
    for (expected, chunk) in ordered.iter().enumerate() {
        if chunk.index != expected as u64 {
            return Err(StoreError::InvalidChunkSet(format!(
                "expected chunk index {expected}, found {}",
                chunk.index
            )));
        }
        if chunk.state == EmbeddingState::Embedded && chunk.vector.is_none() {
            return Err(StoreError::InvalidChunkSet(format!(
                "chunk {} is marked embedded without a vector",
                chunk.index
            )));
        }
    }
    Ok(ordered)
}

/// A chunk selected by the search filter, with its document's source if linked.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: StoredChunk,
    pub source_ref: Option<String>,
}

/// Scores the in-scope chunks and applies threshold, order and top-k.
///
/// `filter_matched` is false when a filter was given and selected no
/// document at all.
pub fn rank(query: &[f32], params: &SearchParams, filter_matched: bool, candidates: Vec<Candidate>) -> SearchOutcome {
    let chunks_in_scope = candidates.len();
    let mut considered = 0usize;
    let mut skipped_other_space = 0usize;
    let mut hits = Vec::new();

    for candidate in candidates {
        let chunk = candidate.chunk;
        let Some(vector) = chunk.vector.as_deref() else {
            continue;
        };
        if chunk.state != EmbeddingState::Embedded {
            continue;
        }
        if chunk.embedding_space.as_deref() != Some(params.embedding_space.as_str()) {
            skipped_other_space += 1;
            continue;
        }
        considered += 1;

        let score = cosine_similarity(query, vector).clamp(0.0, 1.0);
        if score >= params.threshold {
            hits.push(ScoredChunk {
                chunk_id: chunk.id,
                document_id: chunk.document_id.unwrap_or(chunk.claimed_document_id),
                source_ref: candidate.source_ref,
                chunk_index: chunk.chunk_index,
                page: chunk.page,
                text: chunk.text,
                score,
            });
        }
    }

    if skipped_other_space > 0 {
        warn!(
            skipped = skipped_other_space,
            space = %params.embedding_space,
            "chunks embedded in another space were excluded from search"
        );
    }

    hits.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| left.chunk_index.cmp(&right.chunk_index))
            .then_with(|| left.document_id.cmp(&right.document_id))
    });
    hits.truncate(params.top_k);

    let empty_reason = if !hits.is_empty() {
        None
    } else if !filter_matched {
        Some(RetrievalEmpty::FilterMatchedNothing)
    } else if considered == 0 {
        Some(RetrievalEmpty::NothingIndexed)
    } else {
        Some(RetrievalEmpty::BelowThreshold)
    };

    SearchOutcome {
        hits,
        diagnostics: RetrievalDiagnostics {
            threshold: params.threshold,
            top_k: params.top_k,
            filters_applied: params.filter.describe(),
            chunks_in_scope,
            chunks_considered: considered,
            chunks_skipped_other_space: skipped_other_space,
            empty_reason,
        },
    }
}

/// Rejects status changes on a job that already finished.
pub fn check_job_update(stored: &ProcessingJob, update: &ProcessingJob) -> Result<(), StoreError> {
    if stored.status.is_terminal() && stored.status != update.status {
        return Err(StoreError::InvalidJobTransition {
            job_id: stored.id,
            from: stored.status.as_str().to_string(),
            to: update.status.as_str().to_string(),
        });
    }
    Ok(())
}

/// Little-endian f32 encoding used for vector columns.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn blob_to_vector(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "vector blob of {} bytes is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchFilter;
    use chrono::Utc;

    fn candidate(index: u64, vector: Vec<f32>, space: &str) -> Candidate {
        Candidate {
            chunk: StoredChunk {
                id: format!("c{index}"),
                document_id: Some("doc".to_string()),
                claimed_document_id: "doc".to_string(),
                job_id: Uuid::nil(),
                chunk_index: index,
                text: format!("chunk {index}"),
                content_hash: String::new(),
                page: None,
                vector: Some(vector),
                embedding_space: Some(space.to_string()),
                state: EmbeddingState::Embedded,
                created_at: Utc::now(),
            },
            source_ref: Some("a.pdf".to_string()),
        }
    }

    fn params(threshold: f64, top_k: usize) -> SearchParams {
        SearchParams {
            top_k,
            threshold,
            filter: SearchFilter::default(),
            embedding_space: "ngram:char-trigram:2".to_string(),
        }
    }

    #[test]
    fn equal_scores_order_by_chunk_index() {
        let space = "ngram:char-trigram:2";
        let outcome = rank(
            &[1.0, 0.0],
            &params(0.1, 10),
            true,
            vec![
                candidate(2, vec![1.0, 0.0], space),
                candidate(0, vec![1.0, 0.0], space),
                candidate(1, vec![0.6, 0.8], space),
            ],
        );
        let order: Vec<u64> = outcome.hits.iter().map(|hit| hit.chunk_index).collect();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn other_space_is_counted_not_scored() {
        let outcome = rank(
            &[1.0, 0.0],
            &params(0.0, 10),
            true,
            vec![candidate(0, vec![1.0, 0.0], "openai:text-embedding-3-small:2")],
        );
        assert!(outcome.hits.is_empty());
        assert_eq!(outcome.diagnostics.chunks_skipped_other_space, 1);
        assert_eq!(outcome.diagnostics.empty_reason, Some(RetrievalEmpty::NothingIndexed));
    }

    #[test]
    fn raising_threshold_never_adds_hits() {
        let space = "ngram:char-trigram:2";
        let pool = || {
            vec![
                candidate(0, vec![1.0, 0.0], space),
                candidate(1, vec![0.8, 0.6], space),
                candidate(2, vec![0.0, 1.0], space),
            ]
        };
        let mut previous = usize::MAX;
        for threshold in [0.0, 0.3, 0.7, 0.9, 1.0] {
            let count = rank(&[1.0, 0.0], &params(threshold, 10), true, pool()).hits.len();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn gaps_in_chunk_set_are_rejected() {
        let write = |index| ChunkWrite {
            index,
            text: String::new(),
            page: None,
            vector: None,
            state: EmbeddingState::Pending,
        };
        assert!(ordered_chunk_set(&[write(1), write(0)]).is_ok());
        assert!(ordered_chunk_set(&[write(0), write(2)]).is_err());
        assert!(ordered_chunk_set(&[write(0), write(0)]).is_err());
    }

    #[test]
    fn blob_codec_rejects_truncated_data() {
        let blob = vector_to_blob(&[0.25, -1.5]);
        assert_eq!(blob_to_vector(&blob).expect("valid blob"), vec![0.25, -1.5]);
        assert!(blob_to_vector(&blob[..5]).is_err());
    }
}

use crate::chunking::{content_hash, make_chunk_id};
use crate::error::StoreError;
use crate::models::{
    ChunkWrite, Document, EmbeddingState, ProcessingJob, QaSession, SearchOutcome, SearchParams, StoredChunk,
};
use crate::store::{check_job_update, ordered_chunk_set, rank, Candidate, ChunkStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Document>,
    /// Chunk sets keyed by the document id they claim.
    chunks: HashMap<String, Vec<StoredChunk>>,
    jobs: HashMap<Uuid, ProcessingJob>,
    sessions: Vec<QaSession>,
}

/// Process-local store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryChunkStore {
    tables: RwLock<Tables>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if let Some(chunks) = tables.chunks.get_mut(&document.id) {
            for chunk in chunks.iter_mut() {
                chunk.document_id = Some(document.id.clone());
            }
        }
        tables.documents.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.read()?.documents.get(id).cloned())
    }

    async fn find_document_by_source(&self, source_ref: &str) -> Result<Option<Document>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .documents
            .values()
            .filter(|document| document.source_ref == source_ref)
            .max_by_key(|document| document.created_at)
            .cloned())
    }

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        tables.chunks.remove(id);
        tables.jobs.retain(|_, job| job.document_id != id);
        Ok(tables.documents.remove(id).is_some())
    }

    async fn create_job(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        self.write()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let stored = tables.jobs.get_mut(&job.id).ok_or_else(|| StoreError::NotFound {
            entity: "job",
            id: job.id.to_string(),
        })?;
        check_job_update(stored, job)?;
        *stored = job.clone();
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn write_chunks(
        &self,
        job_id: Uuid,
        document_id: &str,
        embedding_space: &str,
        chunks: &[ChunkWrite],
    ) -> Result<(), StoreError> {
        let ordered = ordered_chunk_set(chunks)?;
        let mut tables = self.write()?;
        let linked = tables
            .documents
            .contains_key(document_id)
            .then(|| document_id.to_string());
        let now = Utc::now();

        let set = ordered
            .into_iter()
            .map(|chunk| StoredChunk {
                id: make_chunk_id(document_id, &job_id.to_string(), chunk.index),
                document_id: linked.clone(),
                claimed_document_id: document_id.to_string(),
                job_id,
                chunk_index: chunk.index,
                text: chunk.text.clone(),
                content_hash: content_hash(&chunk.text),
                page: chunk.page,
                vector: chunk.vector.clone(),
                embedding_space: chunk.vector.as_ref().map(|_| embedding_space.to_string()),
                state: chunk.state,
                created_at: now,
            })
            .collect();
        tables.chunks.insert(document_id.to_string(), set);
        Ok(())
    }

    async fn set_embedding(
        &self,
        job_id: Uuid,
        document_id: &str,
        chunk_index: u64,
        vector: &[f32],
        embedding_space: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let chunk = tables
            .chunks
            .get_mut(document_id)
            .and_then(|set| set.iter_mut().find(|chunk| chunk.chunk_index == chunk_index))
            .filter(|chunk| chunk.job_id == job_id)
            .ok_or_else(|| StoreError::Superseded {
                job_id,
                document_id: document_id.to_string(),
            })?;
        chunk.vector = Some(vector.to_vec());
        chunk.embedding_space = Some(embedding_space.to_string());
        chunk.state = EmbeddingState::Embedded;
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>, StoreError> {
        Ok(self
            .read()?
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchOutcome, StoreError> {
        let tables = self.read()?;
        let filter = &params.filter;

        let in_scope = |document_id: &str| {
            let document = tables.documents.get(document_id);
            filter
                .document_id
                .as_deref()
                .map_or(true, |wanted| wanted == document_id)
                && filter
                    .filename_exact
                    .as_deref()
                    .map_or(true, |wanted| document.is_some_and(|doc| doc.source_ref == wanted))
        };

        let filter_matched = filter.is_empty()
            || tables.documents.keys().any(|id| in_scope(id.as_str()))
            || tables.chunks.keys().any(|id| in_scope(id.as_str()));

        let candidates = tables
            .chunks
            .iter()
            .filter(|(document_id, _)| in_scope(document_id.as_str()))
            .flat_map(|(document_id, set)| {
                let source_ref = tables
                    .documents
                    .get(document_id)
                    .map(|document| document.source_ref.clone());
                set.iter().map(move |chunk| Candidate {
                    chunk: chunk.clone(),
                    source_ref: source_ref.clone(),
                })
            })
            .collect();

        Ok(rank(query, params, filter_matched, candidates))
    }

    async fn record_session(&self, session: &QaSession) -> Result<(), StoreError> {
        self.write()?.sessions.push(session.clone());
        Ok(())
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<QaSession>, StoreError> {
        Ok(self
            .read()?
            .sessions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RetrievalEmpty, SearchFilter};

    const SPACE: &str = "test:unit:3";

    fn document(id: &str, source_ref: &str) -> Document {
        Document {
            id: id.to_string(),
            source_ref: source_ref.to_string(),
            content_type: "text/plain".to_string(),
            size_bytes: 10,
            checksum: "x".to_string(),
            created_at: Utc::now(),
        }
    }

    fn embedded(index: u64, vector: Vec<f32>) -> ChunkWrite {
        ChunkWrite {
            index,
            text: format!("chunk {index}"),
            page: None,
            vector: Some(vector),
            state: EmbeddingState::Embedded,
        }
    }

    fn params(threshold: f64, filter: SearchFilter) -> SearchParams {
        SearchParams {
            top_k: 5,
            threshold,
            filter,
            embedding_space: SPACE.to_string(),
        }
    }

    #[tokio::test]
    async fn identical_vector_ranks_its_chunk_first() {
        let store = MemoryChunkStore::new();
        store.put_document(&document("doc", "manual.pdf")).await.expect("put");
        let job = Uuid::new_v4();
        store
            .write_chunks(
                job,
                "doc",
                SPACE,
                &[
                    embedded(0, vec![1.0, 0.0, 0.0]),
                    embedded(1, vec![0.0, 1.0, 0.0]),
                    embedded(2, vec![0.0, 0.0, 1.0]),
                ],
            )
            .await
            .expect("write");

        let outcome = store
            .search(&[0.0, 1.0, 0.0], &params(0.99, SearchFilter::default()))
            .await
            .expect("search");
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].chunk_index, 1);
        assert!((outcome.hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(outcome.hits[0].source_ref.as_deref(), Some("manual.pdf"));
    }

    #[tokio::test]
    async fn chunks_written_before_document_are_backfilled() {
        let store = MemoryChunkStore::new();
        let job = Uuid::new_v4();
        store
            .write_chunks(job, "late", SPACE, &[embedded(0, vec![1.0, 0.0, 0.0])])
            .await
            .expect("write without document");
        assert_eq!(store.chunks_for_document("late").await.expect("read")[0].document_id, None);

        store.put_document(&document("late", "late.txt")).await.expect("put");
        let chunks = store.chunks_for_document("late").await.expect("read");
        assert_eq!(chunks[0].document_id.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn unknown_filename_is_filter_miss_not_error() {
        let store = MemoryChunkStore::new();
        store.put_document(&document("doc", "manual.pdf")).await.expect("put");
        store
            .write_chunks(Uuid::new_v4(), "doc", SPACE, &[embedded(0, vec![1.0, 0.0, 0.0])])
            .await
            .expect("write");

        let filter = SearchFilter {
            document_id: None,
            filename_exact: Some("missing.pdf".to_string()),
        };
        let outcome = store.search(&[1.0, 0.0, 0.0], &params(0.0, filter)).await.expect("search");
        assert!(outcome.hits.is_empty());
        assert_eq!(outcome.diagnostics.empty_reason, Some(RetrievalEmpty::FilterMatchedNothing));
    }

    #[tokio::test]
    async fn newer_job_supersedes_older_chunk_set() {
        let store = MemoryChunkStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let pending = ChunkWrite {
            index: 0,
            text: "a".to_string(),
            page: None,
            vector: None,
            state: EmbeddingState::Pending,
        };
        store.write_chunks(first, "doc", SPACE, &[pending.clone()]).await.expect("first");
        store.write_chunks(second, "doc", SPACE, &[pending]).await.expect("second");

        let error = store
            .set_embedding(first, "doc", 0, &[1.0, 0.0, 0.0], SPACE)
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::Superseded { .. }));
        store
            .set_embedding(second, "doc", 0, &[1.0, 0.0, 0.0], SPACE)
            .await
            .expect("owner may complete its chunk");
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks_and_jobs() {
        let store = MemoryChunkStore::new();
        store.put_document(&document("doc", "a.txt")).await.expect("put");
        let job = ProcessingJob::new("doc");
        store.create_job(&job).await.expect("job");
        store
            .write_chunks(job.id, "doc", SPACE, &[embedded(0, vec![1.0, 0.0, 0.0])])
            .await
            .expect("write");

        assert!(store.delete_document("doc").await.expect("delete"));
        assert!(store.chunks_for_document("doc").await.expect("read").is_empty());
        assert!(store.get_job(job.id).await.expect("read").is_none());
        assert!(!store.delete_document("doc").await.expect("second delete"));
    }
}

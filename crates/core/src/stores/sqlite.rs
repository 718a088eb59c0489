//! SQLite-backed [`ChunkStore`].
//!
//! Vectors live next to their chunk as little-endian f32 blobs. Filtering
//! happens in SQL, similarity is computed in-process over the selected rows.

use crate::chunking::{content_hash, make_chunk_id};
use crate::error::StoreError;
use crate::models::{
    Citation, ChunkWrite, Document, EmbeddingState, JobStatus, ProcessingJob, QaSession, SearchOutcome,
    SearchParams, StoredChunk,
};
use crate::store::{
    blob_to_vector, check_job_update, ordered_chunk_set, rank, vector_to_blob, Candidate, ChunkStore,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_ref TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_ref)",
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT,
        claimed_document_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        page INTEGER,
        embedding BLOB,
        embedding_space TEXT,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (claimed_document_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        status TEXT NOT NULL,
        ocr_provider TEXT,
        embedding_provider TEXT,
        error TEXT,
        pending_indices TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        finished_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS qa_sessions (
        id TEXT PRIMARY KEY,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        citations TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
];

pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    /// Opens (creating if needed) a database file and applies the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private database living as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(Self { pool })
    }
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| StoreError::Corrupt(format!("bad timestamp {value}: {error}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|error| StoreError::Corrupt(format!("bad uuid {value}: {error}")))
}

fn document_from_row(row: &SqliteRow) -> Result<Document, StoreError> {
    Ok(Document {
        id: row.try_get("id")?,
        source_ref: row.try_get("source_ref")?,
        content_type: row.try_get("content_type")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
        checksum: row.try_get("checksum")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<ProcessingJob, StoreError> {
    let status: String = row.try_get("status")?;
    let pending: String = row.try_get("pending_indices")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(ProcessingJob {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        document_id: row.try_get("document_id")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status {status}")))?,
        ocr_provider: row.try_get("ocr_provider")?,
        embedding_provider: row.try_get("embedding_provider")?,
        error: row.try_get("error")?,
        pending_indices: serde_json::from_str(&pending)
            .map_err(|error| StoreError::Corrupt(format!("bad pending indices: {error}")))?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<StoredChunk, StoreError> {
    let state: String = row.try_get("state")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(StoredChunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        claimed_document_id: row.try_get("claimed_document_id")?,
        job_id: parse_uuid(&row.try_get::<String, _>("job_id")?)?,
        chunk_index: row.try_get::<i64, _>("chunk_index")? as u64,
        text: row.try_get("text")?,
        content_hash: row.try_get("content_hash")?,
        page: row.try_get::<Option<i64>, _>("page")?.map(|page| page as u32),
        vector: embedding.as_deref().map(blob_to_vector).transpose()?,
        embedding_space: row.try_get("embedding_space")?,
        state: EmbeddingState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown embedding state {state}")))?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<QaSession, StoreError> {
    let citations: String = row.try_get("citations")?;
    Ok(QaSession {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        question: row.try_get("question")?,
        answer: row.try_get("answer")?,
        citations: serde_json::from_str::<Vec<Citation>>(&citations)
            .map_err(|error| StoreError::Corrupt(format!("bad citations: {error}")))?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn pending_json(indices: &[u64]) -> Result<String, StoreError> {
    serde_json::to_string(indices).map_err(|error| StoreError::Corrupt(error.to_string()))
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn put_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, source_ref, content_type, size_bytes, checksum, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_ref = excluded.source_ref,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum
            "#,
        )
        .bind(&document.id)
        .bind(&document.source_ref)
        .bind(&document.content_type)
        .bind(document.size_bytes as i64)
        .bind(&document.checksum)
        .bind(timestamp(&document.created_at))
        .execute(&mut *tx)
        .await?;

        let linked = sqlx::query(
            "UPDATE chunks SET document_id = ? WHERE claimed_document_id = ? AND document_id IS NULL",
        )
        .bind(&document.id)
        .bind(&document.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if linked > 0 {
            debug!(document_id = %document.id, linked, "backfilled chunk document links");
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document_from_row)
            .transpose()
    }

    async fn find_document_by_source(&self, source_ref: &str) -> Result<Option<Document>, StoreError> {
        sqlx::query("SELECT * FROM documents WHERE source_ref = ? ORDER BY created_at DESC LIMIT 1")
            .bind(source_ref)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document_from_row)
            .transpose()
    }

    async fn delete_document(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE claimed_document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn create_job(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, document_id, status, ocr_provider, embedding_provider, error,
                              pending_indices, created_at, updated_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.document_id)
        .bind(job.status.as_str())
        .bind(&job.ocr_provider)
        .bind(&job.embedding_provider)
        .bind(&job.error)
        .bind(pending_json(&job.pending_indices)?)
        .bind(timestamp(&job.created_at))
        .bind(timestamp(&job.updated_at))
        .bind(job.finished_at.as_ref().map(timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let stored = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job.id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(job_from_row)
            .transpose()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "job",
                id: job.id.to_string(),
            })?;
        check_job_update(&stored, job)?;

        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, ocr_provider = ?, embedding_provider = ?, error = ?,
                            pending_indices = ?, updated_at = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(&job.ocr_provider)
        .bind(&job.embedding_provider)
        .bind(&job.error)
        .bind(pending_json(&job.pending_indices)?)
        .bind(timestamp(&job.updated_at))
        .bind(job.finished_at.as_ref().map(timestamp))
        .bind(job.id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>, StoreError> {
        sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn write_chunks(
        &self,
        job_id: Uuid,
        document_id: &str,
        embedding_space: &str,
        chunks: &[ChunkWrite],
    ) -> Result<(), StoreError> {
        let ordered = ordered_chunk_set(chunks)?;
        let job = job_id.to_string();
        let now = timestamp(&Utc::now());

        let mut tx = self.pool.begin().await?;
        let linked: Option<String> = sqlx::query("SELECT id FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?;

        sqlx::query("DELETE FROM chunks WHERE claimed_document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in ordered {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, claimed_document_id, job_id, chunk_index, text,
                                    content_hash, page, embedding, embedding_space, state, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(make_chunk_id(document_id, &job, chunk.index))
            .bind(&linked)
            .bind(document_id)
            .bind(&job)
            .bind(chunk.index as i64)
            .bind(&chunk.text)
            .bind(content_hash(&chunk.text))
            .bind(chunk.page.map(i64::from))
            .bind(chunk.vector.as_deref().map(vector_to_blob))
            .bind(chunk.vector.as_ref().map(|_| embedding_space))
            .bind(chunk.state.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(document_id, job_id = %job_id, chunk_count = chunks.len(), "chunk set replaced");
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
        let updated = sqlx::query(
            r#"
            UPDATE chunks SET embedding = ?, embedding_space = ?, state = ?
            WHERE claimed_document_id = ? AND chunk_index = ? AND job_id = ?
            "#,
        )
        .bind(vector_to_blob(vector))
        .bind(embedding_space)
        .bind(EmbeddingState::Embedded.as_str())
        .bind(document_id)
        .bind(chunk_index as i64)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::Superseded {
                job_id,
                document_id: document_id.to_string(),
            });
        }
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>, StoreError> {
        sqlx::query("SELECT * FROM chunks WHERE claimed_document_id = ? ORDER BY chunk_index ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(chunk_from_row)
            .collect()
    }

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchOutcome, StoreError> {
        let filter = &params.filter;
        let rows = sqlx::query(
            r#"
            SELECT c.*, d.source_ref AS source_ref
            FROM chunks c
            LEFT JOIN documents d ON d.id = c.document_id
            WHERE (?1 IS NULL OR c.claimed_document_id = ?1)
              AND (?2 IS NULL OR d.source_ref = ?2)
            "#,
        )
        .bind(&filter.document_id)
        .bind(&filter.filename_exact)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                Ok(Candidate {
                    chunk: chunk_from_row(row)?,
                    source_ref: row.try_get("source_ref")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let filter_matched = if filter.is_empty() || !candidates.is_empty() {
            true
        } else {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM documents
                WHERE (?1 IS NULL OR id = ?1) AND (?2 IS NULL OR source_ref = ?2)
                "#,
            )
            .bind(&filter.document_id)
            .bind(&filter.filename_exact)
            .fetch_one(&self.pool)
            .await?
                > 0
        };

        Ok(rank(query, params, filter_matched, candidates))
    }

    async fn record_session(&self, session: &QaSession) -> Result<(), StoreError> {
        let citations = serde_json::to_string(&session.citations)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;
        sqlx::query("INSERT INTO qa_sessions (id, question, answer, citations, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(session.id.to_string())
            .bind(&session.question)
            .bind(&session.answer)
            .bind(citations)
            .bind(timestamp(&session.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<QaSession>, StoreError> {
        sqlx::query("SELECT * FROM qa_sessions ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(session_from_row)
            .collect()
    }
}

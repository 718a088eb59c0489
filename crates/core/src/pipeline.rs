//! Composes the stages into the ingestion and question-answering flows.

use crate::chunking::{chunk_text, TextChunk};
use crate::config::{EffectiveParams, Overrides, PipelineConfig};
use crate::embeddings::EmbeddingGenerator;
use crate::error::{PipelineError, Stage, StoreError};
use crate::extractor::Extraction;
use crate::models::{
    ChunkWrite, Document, EmbeddingState, JobStatus, ProcessingJob, QaSession, SearchFilter, SearchParams,
};
use crate::normalizer::normalize;
use crate::object_store::ObjectStore;
use crate::registry::ProviderRegistry;
use crate::store::ChunkStore;
use crate::synthesizer::{no_relevant_information, Answer, AnswerSynthesizer};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Where the bytes of an upload come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Reference into the object store.
    Reference(String),
    Inline(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub source: FileSource,
    pub content_type: String,
    /// Filename or URL recorded on the document. Defaults to the reference.
    pub source_ref: Option<String>,
    pub overrides: Overrides,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionMetadata {
    pub provider_used: String,
    pub confidence: Option<f32>,
    pub page_count: Option<u32>,
    pub empty: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResult {
    pub document_id: String,
    pub job_id: Uuid,
    pub extracted_text: String,
    pub chunks: Vec<TextChunk>,
    pub metadata: ExtractionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexChunk {
    pub index: u64,
    pub text: String,
    #[serde(default)]
    pub page: Option<u32>,
}

impl From<&TextChunk> for IndexChunk {
    fn from(chunk: &TextChunk) -> Self {
        Self {
            index: chunk.index,
            text: chunk.text.clone(),
            page: chunk.page,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub document_id: String,
    pub job_id: Uuid,
    pub chunks: Vec<IndexChunk>,
    pub embedding_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexResult {
    pub job_id: Uuid,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    /// Indices awaiting a retry.
    pub pending_indices: Vec<u64>,
    pub embedding_space: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub extraction: ExtractResult,
    /// `None` when extraction produced nothing to index.
    pub index: Option<IndexResult>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    pub filter: SearchFilter,
    pub overrides: Overrides,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub session_id: Uuid,
    pub answer: Answer,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: ProviderRegistry,
    store: Arc<dyn ChunkStore>,
    objects: Option<Arc<dyn ObjectStore>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, registry: ProviderRegistry, store: Arc<dyn ChunkStore>) -> Self {
        Self {
            config,
            registry,
            store,
            objects: None,
        }
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    fn embedding_generator(&self, name: &str) -> Result<EmbeddingGenerator, PipelineError> {
        Ok(EmbeddingGenerator::new(
            self.registry.embedder(name)?,
            self.config.embedding_timeout(),
            self.config.embedding_batch_size,
        ))
    }

    async fn resolve_bytes(&self, source: &FileSource) -> Result<Vec<u8>, PipelineError> {
        match source {
            FileSource::Inline(bytes) => Ok(bytes.clone()),
            FileSource::Reference(file_ref) => {
                let objects = self.objects.as_ref().ok_or_else(|| {
                    PipelineError::InvalidRequest("fileRef given but no object store is configured".to_string())
                })?;
                objects.fetch(file_ref).await
            }
        }
    }

    /// Reuses the document when the same source was uploaded with the same bytes.
    async fn document_for(
        &self,
        source_ref: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<Document, PipelineError> {
        let checksum = content_hash_bytes(bytes);
        if let Some(existing) = self.store.find_document_by_source(source_ref).await? {
            if existing.checksum == checksum {
                return Ok(existing);
            }
        }
        let document = Document {
            id: Uuid::new_v4().to_string(),
            source_ref: source_ref.to_string(),
            content_type: content_type.to_string(),
            size_bytes: bytes.len() as u64,
            checksum,
            created_at: Utc::now(),
        };
        self.store.put_document(&document).await?;
        Ok(document)
    }

    /// Records a failed job. The original error is what the caller sees.
    async fn fail_job(&self, job: &mut ProcessingJob, error: &PipelineError) {
        if job.status.is_terminal() {
            return;
        }
        if let Err(transition) = job.fail(error.to_string()) {
            warn!(job_id = %job.id, %transition, "could not mark job failed");
            return;
        }
        if let Err(store_error) = self.store.update_job(job).await {
            warn!(job_id = %job.id, %store_error, "could not persist failed job");
        }
    }

    async fn advance(&self, job: &mut ProcessingJob, next: JobStatus) -> Result<(), PipelineError> {
        job.advance(next)?;
        self.store.update_job(job).await?;
        Ok(())
    }

    /// Extraction, normalization and chunking. Chunks are stored as pending
    /// embedding; an empty extraction completes the job with no chunks.
    pub async fn extract_and_chunk(
        &self,
        request: ExtractRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractResult, PipelineError> {
        let params = self.config.effective(&request.overrides)?;
        let source_ref = match (&request.source_ref, &request.source) {
            (Some(name), _) => name.clone(),
            (None, FileSource::Reference(file_ref)) => file_ref.clone(),
            (None, FileSource::Inline(_)) => "upload".to_string(),
        };
        if request.content_type.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("contentType is required".to_string()));
        }

        let bytes = self.resolve_bytes(&request.source).await?;
        let document = self
            .document_for(&source_ref, &request.content_type, &bytes)
            .await?;

        let mut job = ProcessingJob::new(&document.id);
        job.ocr_provider = params.ocr_provider.clone();
        self.store.create_job(&job).await?;

        match self
            .run_extraction(&mut job, &document, &bytes, &request.content_type, &params, cancel)
            .await
        {
            Ok(result) => Ok(result),
            Err(error) => {
                self.fail_job(&mut job, &error).await;
                Err(error.for_job(job.id))
            }
        }
    }

    async fn run_extraction(
        &self,
        job: &mut ProcessingJob,
        document: &Document,
        bytes: &[u8],
        content_type: &str,
        params: &EffectiveParams,
        cancel: &CancellationToken,
    ) -> Result<ExtractResult, PipelineError> {
        let started = Instant::now();
        self.advance(job, JobStatus::Extracting).await?;

        let extraction: Extraction = self
            .registry
            .extractor()
            .extract(bytes, content_type, params.ocr_provider.as_deref(), cancel)
            .await?;
        job.ocr_provider = Some(extraction.provider_used.clone());
        self.advance(job, JobStatus::Chunking).await?;

        let normalized = normalize(&extraction.text);
        let chunks = chunk_text(&normalized, params.chunking);

        if chunks.is_empty() {
            self.advance(job, JobStatus::Completed).await?;
            info!(job_id = %job.id, document_id = %document.id, "nothing to index");
        } else {
            let writes: Vec<ChunkWrite> = chunks
                .iter()
                .map(|chunk| ChunkWrite {
                    index: chunk.index,
                    text: chunk.text.clone(),
                    page: chunk.page,
                    vector: None,
                    state: EmbeddingState::Pending,
                })
                .collect();
            self.store
                .write_chunks(job.id, &document.id, "", &writes)
                .await?;
            info!(
                job_id = %job.id,
                document_id = %document.id,
                provider = %extraction.provider_used,
                chunk_count = chunks.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "document extracted and chunked"
            );
        }

        Ok(ExtractResult {
            document_id: document.id.clone(),
            job_id: job.id,
            extracted_text: normalized,
            chunks,
            metadata: ExtractionMetadata {
                provider_used: extraction.provider_used,
                confidence: extraction.confidence,
                page_count: extraction.page_count,
                empty: extraction.empty,
            },
        })
    }

    /// Embeds chunks one state per chunk and replaces the document's chunk
    /// set with the result. Partial failure completes the job with the
    /// failed indices pending.
    pub async fn embed_and_index(
        &self,
        request: IndexRequest,
        cancel: &CancellationToken,
    ) -> Result<IndexResult, PipelineError> {
        let mut job = self
            .store
            .get_job(request.job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "job",
                id: request.job_id.to_string(),
            })?;
        if job.document_id != request.document_id {
            return Err(PipelineError::InvalidRequest(format!(
                "job {} belongs to document {}, not {}",
                job.id, job.document_id, request.document_id
            )));
        }

        let provider_name = request
            .embedding_provider
            .clone()
            .unwrap_or_else(|| self.config.default_embedding_provider.clone());
        let generator = self.embedding_generator(&provider_name)?;

        if request.chunks.is_empty() {
            if job.status != JobStatus::Completed {
                self.advance(&mut job, JobStatus::Completed).await?;
            }
            return Ok(IndexResult {
                job_id: job.id,
                chunks_embedded: 0,
                chunks_failed: 0,
                pending_indices: Vec::new(),
                embedding_space: generator.embedding_space(),
            });
        }
        job.embedding_provider = Some(provider_name);
        self.advance(&mut job, JobStatus::Embedding).await?;

        match self.run_indexing(&mut job, &request, &generator, cancel).await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.fail_job(&mut job, &error).await;
                Err(error.for_job(job.id))
            }
        }
    }

    async fn run_indexing(
        &self,
        job: &mut ProcessingJob,
        request: &IndexRequest,
        generator: &EmbeddingGenerator,
        cancel: &CancellationToken,
    ) -> Result<IndexResult, PipelineError> {
        let started = Instant::now();
        let texts: Vec<String> = request.chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let outcomes = generator
            .embed_tolerant(&texts, cancel)
            .await
            .map_err(|error| PipelineError::stage(Stage::Embedding, Some(job.id), error))?;

        let mut first_error = None;
        let mut writes = Vec::with_capacity(outcomes.len());
        let mut pending = Vec::new();
        for (chunk, outcome) in request.chunks.iter().zip(outcomes) {
            if outcome.state == EmbeddingState::Failed {
                pending.push(chunk.index);
                if first_error.is_none() {
                    first_error = outcome.error;
                }
            }
            writes.push(ChunkWrite {
                index: chunk.index,
                text: chunk.text.clone(),
                page: chunk.page,
                vector: outcome.vector,
                state: outcome.state,
            });
        }
        pending.sort_unstable();

        let space = generator.embedding_space();
        self.store
            .write_chunks(job.id, &request.document_id, &space, &writes)
            .await?;

        let failed = pending.len();
        let embedded = writes.len() - failed;
        if embedded == 0 {
            if let Some(error) = first_error {
                return Err(PipelineError::stage(Stage::Embedding, Some(job.id), error));
            }
        }

        job.pending_indices = pending.clone();
        self.advance(job, JobStatus::Completed).await?;
        info!(
            job_id = %job.id,
            provider = generator.provider_name(),
            chunk_count = writes.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chunks indexed"
        );

        Ok(IndexResult {
            job_id: job.id,
            chunks_embedded: embedded,
            chunks_failed: failed,
            pending_indices: pending,
            embedding_space: space,
        })
    }

    /// Both stages back to back.
    pub async fn ingest(
        &self,
        request: ExtractRequest,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, PipelineError> {
        let embedding_provider = request.overrides.embedding_provider.clone();
        let extraction = self.extract_and_chunk(request, cancel).await?;
        if extraction.chunks.is_empty() {
            return Ok(IngestOutcome {
                extraction,
                index: None,
            });
        }

        let index = self
            .embed_and_index(
                IndexRequest {
                    document_id: extraction.document_id.clone(),
                    job_id: extraction.job_id,
                    chunks: extraction.chunks.iter().map(IndexChunk::from).collect(),
                    embedding_provider,
                },
                cancel,
            )
            .await?;
        Ok(IngestOutcome {
            extraction,
            index: Some(index),
        })
    }

    /// Re-embeds a job's pending chunks, once each.
    pub async fn retry_pending(&self, job_id: Uuid, cancel: &CancellationToken) -> Result<IndexResult, PipelineError> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;
        let provider_name = job
            .embedding_provider
            .clone()
            .unwrap_or_else(|| self.config.default_embedding_provider.clone());
        let generator = self.embedding_generator(&provider_name)?;
        let space = generator.embedding_space();

        if job.pending_indices.is_empty() {
            return Ok(IndexResult {
                job_id,
                chunks_embedded: 0,
                chunks_failed: 0,
                pending_indices: Vec::new(),
                embedding_space: space,
            });
        }
        if job.status != JobStatus::Completed {
            return Err(PipelineError::InvalidRequest(format!(
                "job {job_id} is {}, only completed jobs can retry",
                job.status.as_str()
            )));
        }

        let chunks = self.store.chunks_for_document(&job.document_id).await?;
        let mut still_pending = Vec::new();
        let mut embedded = 0usize;
        for index in job.pending_indices.clone() {
            let Some(chunk) = chunks
                .iter()
                .find(|chunk| chunk.chunk_index == index && chunk.job_id == job_id)
            else {
                return Err(StoreError::Superseded {
                    job_id,
                    document_id: job.document_id.clone(),
                }
                .into());
            };
            match generator.embed(&chunk.text, cancel).await {
                Ok(vector) => {
                    self.store
                        .set_embedding(job_id, &job.document_id, index, &vector, &space)
                        .await?;
                    embedded += 1;
                }
                Err(error) if error.is_cancelled() => return Err(PipelineError::Cancelled),
                Err(error) => {
                    warn!(job_id = %job_id, index, %error, "retry failed, chunk stays pending");
                    still_pending.push(index);
                }
            }
        }

        job.pending_indices = still_pending.clone();
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;
        info!(job_id = %job_id, embedded, pending = still_pending.len(), "pending chunks retried");

        Ok(IndexResult {
            job_id,
            chunks_embedded: embedded,
            chunks_failed: still_pending.len(),
            pending_indices: still_pending,
            embedding_space: space,
        })
    }

    /// Embeds the question, retrieves and synthesizes. Every answered or
    /// unanswered question is recorded as a session.
    pub async fn query(&self, request: QueryRequest, cancel: &CancellationToken) -> Result<QueryResult, PipelineError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidRequest("question must not be empty".to_string()));
        }
        let params = self.config.effective(&request.overrides)?;
        let generator = self.embedding_generator(&params.embedding_provider)?;

        let vector = generator
            .embed(question, cancel)
            .await
            .map_err(|error| PipelineError::stage(Stage::Retrieval, None, error))?;
        let retrieval = self
            .store
            .search(
                &vector,
                &SearchParams {
                    top_k: params.top_k,
                    threshold: params.similarity_threshold,
                    filter: request.filter.clone(),
                    embedding_space: generator.embedding_space(),
                },
            )
            .await?;

        let answer = if retrieval.hits.is_empty() {
            no_relevant_information(retrieval.diagnostics)
        } else {
            let primary = self.registry.generator(&params.generation_provider)?;
            let fallback = self
                .config
                .fallback_generation_provider
                .as_deref()
                .and_then(|name| match self.registry.generator(name) {
                    Ok(provider) => Some(provider),
                    Err(error) => {
                        warn!(%error, "fallback generation provider unavailable");
                        None
                    }
                });
            AnswerSynthesizer::new(self.config.generation_timeout())
                .answer(question, retrieval, primary, fallback, cancel)
                .await?
        };

        let session = QaSession {
            id: Uuid::new_v4(),
            question: question.to_string(),
            answer: answer.text.clone(),
            citations: answer.citations.clone(),
            created_at: Utc::now(),
        };
        self.store.record_session(&session).await?;

        Ok(QueryResult {
            session_id: session.id,
            answer,
        })
    }

    pub async fn job(&self, job_id: Uuid) -> Result<ProcessingJob, PipelineError> {
        self.store.get_job(job_id).await?.ok_or_else(|| {
            StoreError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            }
            .into()
        })
    }
}

fn content_hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

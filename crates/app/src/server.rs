//! HTTP surface over the pipeline stages.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/extract-and-chunk` | Extract, normalize and chunk one upload |
//! | `POST` | `/embed-and-index` | Embed a chunk set and index it |
//! | `POST` | `/query` | Answer a question from the indexed chunks |
//! | `GET`  | `/jobs/{id}` | Processing job status |
//! | `POST` | `/jobs/{id}/retry` | Re-embed the job's pending chunks |
//! | `GET`  | `/health` | Health check |
//!
//! Errors are `{ "success": false, "error": "...", "errorCode": "..." }`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ragline_core::{
    explain_empty, AnswerStatus, Citation, ExtractRequest, FileSource, IndexChunk, IndexRequest, IndexResult,
    Overrides, Pipeline, PipelineError, ProcessingJob, QueryRequest, RetrievalDiagnostics, SearchFilter,
    TextChunk,
};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/extract-and-chunk", post(handle_extract_and_chunk))
        .route("/embed-and-index", post(handle_embed_and_index))
        .route("/query", post(handle_query))
        .route("/jobs/{id}", get(handle_job))
        .route("/jobs/{id}/retry", post(handle_retry))
        .route("/health", get(handle_health))
        .with_state(AppState { pipeline })
}

/// Serves until ctrl-c.
pub async fn run_server(pipeline: Arc<Pipeline>, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "server listening");
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "could not listen for shutdown signal");
            }
        })
        .await?;
    info!("server stopped");
    Ok(())
}

/// Token cancelled when the handler future is dropped, which is what hyper
/// does once the client disconnects.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

// ============ Errors ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    error_code: String,
    detail: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
            error_code: self.code,
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(error: PipelineError) -> Self {
        let code = error.error_code();
        let status = match code {
            "invalid_request" | "invalid_chunk_config" | "unknown_provider" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "job_superseded" | "invalid_job_state" => StatusCode::CONFLICT,
            "provider_timeout" => StatusCode::GATEWAY_TIMEOUT,
            "provider_error" | "provider_limit" | "provider_not_configured" | "providers_exhausted" => {
                StatusCode::BAD_GATEWAY
            }
            "cancelled" => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(code, %error, "request failed");
        } else {
            warn!(code, %error, "request rejected");
        }
        Self {
            status,
            code: code.to_string(),
            message: error.user_message(),
            detail: error.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    let message = message.into();
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_request".to_string(),
        detail: message.clone(),
        message,
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("'{raw}' is not a job id")))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /extract-and-chunk ============

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractBody {
    file_ref: Option<String>,
    #[serde_as(as = "Option<Base64>")]
    file_bytes_base64: Option<Vec<u8>>,
    content_type: String,
    filename: Option<String>,
    ocr_provider: Option<String>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractMetadataBody {
    provider_used: String,
    confidence: Option<f32>,
    page_count: Option<u32>,
    empty: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractResponse {
    success: bool,
    extracted_text: String,
    chunks_created: usize,
    chunks: Vec<TextChunk>,
    job_id: Uuid,
    document_id: String,
    metadata: ExtractMetadataBody,
}

async fn handle_extract_and_chunk(
    State(state): State<AppState>,
    body: Result<Json<ExtractBody>, JsonRejection>,
) -> Result<Json<ExtractResponse>, AppError> {
    let body = json_body(body)?;
    let source = match (body.file_ref, body.file_bytes_base64) {
        (Some(file_ref), None) => FileSource::Reference(file_ref),
        (None, Some(bytes)) => FileSource::Inline(bytes),
        (Some(_), Some(_)) => return Err(bad_request("send either fileRef or fileBytesBase64, not both")),
        (None, None) => return Err(bad_request("fileRef or fileBytesBase64 is required")),
    };

    let (cancel, _guard) = request_token();
    let result = state
        .pipeline
        .extract_and_chunk(
            ExtractRequest {
                source,
                content_type: body.content_type,
                source_ref: body.filename,
                overrides: Overrides {
                    ocr_provider: body.ocr_provider,
                    chunk_size: body.chunk_size,
                    chunk_overlap: body.chunk_overlap,
                    ..Overrides::default()
                },
            },
            &cancel,
        )
        .await?;

    Ok(Json(ExtractResponse {
        success: true,
        chunks_created: result.chunks.len(),
        extracted_text: result.extracted_text,
        chunks: result.chunks,
        job_id: result.job_id,
        document_id: result.document_id,
        metadata: ExtractMetadataBody {
            provider_used: result.metadata.provider_used,
            confidence: result.metadata.confidence,
            page_count: result.metadata.page_count,
            empty: result.metadata.empty,
        },
    }))
}

// ============ POST /embed-and-index ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexBody {
    document_id: String,
    job_id: Uuid,
    chunks: Vec<IndexChunk>,
    embedding_provider: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexResponse {
    success: bool,
    #[serde(flatten)]
    result: IndexResult,
}

async fn handle_embed_and_index(
    State(state): State<AppState>,
    body: Result<Json<IndexBody>, JsonRejection>,
) -> Result<Json<IndexResponse>, AppError> {
    let body = json_body(body)?;
    let (cancel, _guard) = request_token();
    let result = state
        .pipeline
        .embed_and_index(
            IndexRequest {
                document_id: body.document_id,
                job_id: body.job_id,
                chunks: body.chunks,
                embedding_provider: body.embedding_provider,
            },
            &cancel,
        )
        .await?;
    Ok(Json(IndexResponse { success: true, result }))
}

// ============ POST /query ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    question: String,
    document_id: Option<String>,
    filename_exact: Option<String>,
    top_k: Option<usize>,
    similarity_threshold: Option<f64>,
    generation_provider: Option<String>,
    embedding_provider: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticsBody {
    #[serde(flatten)]
    retrieval: RetrievalDiagnostics,
    /// Set when nothing cleared retrieval.
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    success: bool,
    session_id: Uuid,
    answer_text: String,
    status: AnswerStatus,
    citations: Vec<Citation>,
    provider_used: Option<String>,
    diagnostics: DiagnosticsBody,
}

async fn handle_query(
    State(state): State<AppState>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let body = json_body(body)?;
    let (cancel, _guard) = request_token();
    let result = state
        .pipeline
        .query(
            QueryRequest {
                question: body.question,
                filter: SearchFilter {
                    document_id: body.document_id,
                    filename_exact: body.filename_exact,
                },
                overrides: Overrides {
                    top_k: body.top_k,
                    similarity_threshold: body.similarity_threshold,
                    generation_provider: body.generation_provider,
                    embedding_provider: body.embedding_provider,
                    ..Overrides::default()
                },
            },
            &cancel,
        )
        .await?;

    let answer = result.answer;
    let explanation = (answer.status == AnswerStatus::NoRelevantInformation)
        .then(|| explain_empty(&answer.diagnostics));
    Ok(Json(QueryResponse {
        success: true,
        session_id: result.session_id,
        answer_text: answer.text,
        status: answer.status,
        citations: answer.citations,
        provider_used: answer.provider_used,
        diagnostics: DiagnosticsBody {
            retrieval: answer.diagnostics,
            explanation,
        },
    }))
}

// ============ /jobs/{id} ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    success: bool,
    job: ProcessingJob,
    duration_ms: Option<i64>,
}

async fn handle_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobResponse>, AppError> {
    let job = state.pipeline.job(parse_job_id(&id)?).await?;
    Ok(Json(JobResponse {
        success: true,
        duration_ms: job.duration_ms(),
        job,
    }))
}

async fn handle_retry(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<IndexResponse>, AppError> {
    let job_id = parse_job_id(&id)?;
    let (cancel, _guard) = request_token();
    let result = state.pipeline.retry_pending(job_id, &cancel).await?;
    Ok(Json(IndexResponse { success: true, result }))
}

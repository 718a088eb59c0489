pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod models;
pub mod normalizer;
pub mod object_store;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod stores;
pub mod synthesizer;

pub use chunking::{chunk, chunk_text, reconstruct, ChunkingConfig, TextChunk};
pub use config::{EffectiveParams, EndpointSettings, Overrides, PipelineConfig, ProviderSettings};
pub use embeddings::{
    cosine_similarity, EmbeddingGenerator, EmbeddingProvider, NgramEmbedder, OllamaEmbedder, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{PipelineError, ProviderError, ProviderFailure, Stage, StoreError};
pub use extractor::{Extraction, OcrProvider, TextExtractor};
pub use generation::{AnthropicGenerator, GenerationProvider, OllamaGenerator, OpenAiGenerator, Prompt};
pub use ingest::{content_type_for, discover_files, ingest_folder, FolderReport, SkippedFile};
pub use models::{
    AnswerStatus, Citation, Document, EmbeddingState, JobStatus, ProcessingJob, QaSession, RetrievalDiagnostics,
    RetrievalEmpty, ScoredChunk, SearchFilter, SearchOutcome, SearchParams, StoredChunk,
};
pub use normalizer::normalize;
pub use object_store::{FsObjectStore, ObjectStore};
pub use pipeline::{
    ExtractRequest, ExtractResult, FileSource, IndexChunk, IndexRequest, IndexResult, IngestOutcome, Pipeline,
    QueryRequest, QueryResult,
};
pub use registry::ProviderRegistry;
pub use store::ChunkStore;
pub use stores::{MemoryChunkStore, SqliteChunkStore};
pub use synthesizer::{explain_empty, Answer, AnswerSynthesizer, NO_RELEVANT_INFORMATION};

//! ragd - 로컬 RAG 서버
//!
//! 문서를 청크로 나눠 Ollama 임베딩과 함께 영속 벡터 인덱스에 저장하고,
//! 질문이 오면 관련 청크를 검색해 로컬 LLM으로 답변을 생성합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod knowledge;
pub mod llm;
pub mod ollama;
pub mod rag;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{Language, ModelIdentity, Settings, VectorBackend};
pub use embedding::{EmbeddingProvider, OllamaEmbedding};
pub use knowledge::{
    default_chunker, open_vector_store, BoundaryChunker, ChunkConfig, Chunker, DocumentChunk,
    LanceVectorStore, SearchResult, SqliteVectorStore, TextSpan, VectorEntry, VectorStore,
};
pub use llm::{parse_response, GenerationProvider, OllamaGeneration, ParsedResponse};
pub use ollama::{BackendError, OllamaClient};
pub use rag::{
    IngestOutcome, IngestRequest, IngestTicket, QueryRequest, QueryResult, RagError, RagService,
};

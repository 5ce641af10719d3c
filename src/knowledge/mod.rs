//! Knowledge 모듈 - 청킹 + 영속 벡터 인덱스
//!
//! - Chunker: 문단/문장 경계 인식 텍스트 분할
//! - SQLite: 기본 벡터 저장소 (정확 검색)
//! - LanceDB: 대용량용 ANN 벡터 저장소

mod chunker;
mod lance;
mod store;
mod vector;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::config::VectorBackend;

// Re-exports
pub use chunker::{
    boundary_chunker, default_chunker, BoundaryChunker, ChunkConfig, Chunker, TextSpan,
};
pub use lance::{LanceVectorStore, LANCE_DIR_NAME};
pub use store::{SqliteVectorStore, DB_FILE_NAME};
pub use vector::{
    chunk_id, cosine_similarity, DocumentChunk, SearchResult, VectorEntry, VectorStore,
};
#[cfg(test)]
pub(crate) use vector::rank_by_similarity;

/// 설정된 백엔드로 영속 디렉토리의 벡터 저장소를 엶
pub async fn open_vector_store(backend: VectorBackend, dir: &Path) -> Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match backend {
        VectorBackend::Sqlite => Arc::new(SqliteVectorStore::open_in(dir)?),
        VectorBackend::Lance => Arc::new(LanceVectorStore::open_in(dir).await?),
    };
    tracing::info!("Vector store opened: {} ({})", store.name(), dir.display());
    Ok(store)
}

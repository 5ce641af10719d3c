//! Vector Store - 벡터 저장소 트레이트 및 유틸리티
//!
//! 저장 백엔드(SQLite, LanceDB)가 공통으로 구현하는 인터페이스입니다.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::chunker::TextSpan;

// ============================================================================
// Types
// ============================================================================

/// 문서 청크 (수집 파이프라인 내부에서만 사용)
///
/// `embedding`은 계산되기 전까지 `None`이며, 임베딩이 없는 청크는
/// 저장소에 들어갈 수 없습니다 ([`DocumentChunk::into_entry`] 참고).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub source: String,
    pub offset: usize,
    pub embedding: Option<Vec<f32>>,
}

impl DocumentChunk {
    /// 청커 결과로부터 생성 (id는 결정적으로 계산)
    pub fn from_span(source: &str, span: TextSpan) -> Self {
        Self {
            id: chunk_id(source, span.offset, &span.text),
            text: span.text,
            source: source.to_string(),
            offset: span.offset,
            embedding: None,
        }
    }

    /// 임베딩이 계산된 청크만 인덱스 엔트리로 변환
    pub fn into_entry(self) -> Option<VectorEntry> {
        let embedding = self.embedding?;
        Some(VectorEntry {
            id: self.id,
            source: self.source,
            offset: self.offset,
            text: self.text,
            embedding,
        })
    }
}

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// 청크 ID (source, offset, text로부터 유도)
    pub id: String,
    /// 원본 식별자 (파일명 등)
    pub source: String,
    /// 원본 내 바이트 오프셋
    pub offset: usize,
    /// 청크 텍스트
    pub text: String,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

/// 검색 결과
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub source: String,
    pub offset: usize,
    pub text: String,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// 구현체는 다음을 보장해야 합니다:
/// - `upsert`는 같은 id를 덮어쓰며, 한 배치는 원자적으로 보입니다.
/// - `search`는 유사도 내림차순, 동점이면 먼저 삽입된 엔트리가 앞섭니다.
/// - 인덱스가 비어 있으면 `search`는 빈 벡터를 돌려줍니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 엔트리 배치 upsert
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize>;

    /// 최근접 k개 검색
    async fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<SearchResult>>;

    /// 전체 엔트리 수
    async fn count(&self) -> Result<usize>;

    /// 특정 source의 엔트리 수
    async fn count_by_source(&self, source: &str) -> Result<usize>;

    /// 백엔드 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 청크 ID 계산
///
/// `sha256(source ‖ 0x00 ‖ offset ‖ 0x00 ‖ text)`의 16진 문자열.
/// 같은 내용을 다시 수집해도 같은 ID가 나옵니다.
pub fn chunk_id(source: &str, offset: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(offset.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// (유사도 내림차순, 삽입 순서 오름차순)으로 정렬 후 k개로 자름
pub(crate) fn rank_by_similarity(mut scored: Vec<(i64, SearchResult)>, k: usize) -> Vec<SearchResult> {
    scored.sort_by(|(seq_a, a), (seq_b, b)| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(seq_a.cmp(seq_b))
    });
    scored.truncate(k);
    scored.into_iter().map(|(_, r)| r).collect()
}

// ============================================================================
// Tests
// ============================================================================

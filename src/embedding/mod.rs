//! 임베딩 모듈 - Ollama를 통한 텍스트 벡터화
//!
//! 텍스트를 벡터로 변환하는 임베딩 프로바이더입니다.
//! 시맨틱 검색을 위한 핵심 모듈입니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let client = Arc::new(OllamaClient::new(DEFAULT_HOST, Duration::from_secs(5))?);
//! let embedder = OllamaEmbedding::new(client, "nomic-embed-text");
//! let vectors = embedder.embed(&["Hello, world!".to_string()]).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ollama::{BackendError, OllamaClient};

/// 한 번의 요청에 담는 기본 텍스트 수
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// 기본 요청 타임아웃
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 입력 하나당 벡터 하나, 입력 순서 그대로 돌려줍니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 배치 임베딩
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// 단일 텍스트 임베딩
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| BackendError::malformed("empty embedding response"))
    }

    /// 설정된 모델 이름
    fn model(&self) -> &str;
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// Ollama `/api/embed` 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Ollama `/api/embed` 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama 임베딩 구현체
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: Arc<OllamaClient>,
    model: String,
    batch_size: usize,
    timeout: Duration,
}

impl OllamaEmbedding {
    /// 새 인스턴스 생성
    ///
    /// # Arguments
    /// * `client` - 공유 Ollama 클라이언트
    /// * `model` - 임베딩 모델 이름 (예: `nomic-embed-text`)
    pub fn new(client: Arc<OllamaClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// 요청당 텍스트 수 지정 (0이면 1로 취급)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 한 배치 요청
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response: EmbedResponse = self
            .client
            .post_json("/api/embed", &self.model, &request, self.timeout)
            .await?;

        if response.embeddings.len() != texts.len() {
            return Err(BackendError::malformed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }

        Ok(response.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut results = Vec::with_capacity(texts.len());
        let total = texts.len().div_ceil(self.batch_size);

        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!("Embedding batch {}/{} ({} texts)", i + 1, total, batch.len());
            results.extend(self.embed_batch(batch).await?);
        }

        // 모델 하나는 차원 하나
        if let Some(first) = results.first() {
            let dimension = first.len();
            if dimension == 0 || results.iter().any(|v| v.len() != dimension) {
                return Err(BackendError::malformed(
                    "embedding dimensions differ within one response",
                ));
            }
        }

        Ok(results)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_fake_ollama, MISSING_MODEL};

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_embed_preserves_order() {
        let (client, state) = spawn_fake_ollama().await;
        let embedder = OllamaEmbedding::new(client, "nomic-embed-text");

        let input = texts(&["a", "bb", "ccc"]);
        let vectors = embedder.embed(&input).await.unwrap();

        assert_eq!(vectors.len(), 3);
        for (text, vector) in input.iter().zip(&vectors) {
            assert_eq!(vector, &crate::testing::fake_vector(text));
        }
        assert_eq!(state.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_embed_batches_requests() {
        let (client, state) = spawn_fake_ollama().await;
        let embedder = OllamaEmbedding::new(client, "nomic-embed-text").with_batch_size(2);

        let input = texts(&["one", "two", "three", "four", "five"]);
        let vectors = embedder.embed(&input).await.unwrap();

        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[4], crate::testing::fake_vector("five"));
        assert_eq!(state.embed_calls(), 3);
    }

    #[tokio::test]
    async fn test_embed_empty_input_makes_no_call() {
        let (client, state) = spawn_fake_ollama().await;
        let embedder = OllamaEmbedding::new(client, "nomic-embed-text");

        assert!(embedder.embed(&[]).await.unwrap().is_empty());
        assert_eq!(state.embed_calls(), 0);
    }

    #[tokio::test]
    async fn test_embed_missing_model() {
        let (client, _state) = spawn_fake_ollama().await;
        let embedder = OllamaEmbedding::new(client, MISSING_MODEL);

        let err = embedder.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, BackendError::ModelNotFound { ref model } if model == MISSING_MODEL));
    }

    #[tokio::test]
    async fn test_embed_unreachable_backend() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Arc::new(
            OllamaClient::new(&format!("http://{}", addr), Duration::from_secs(1)).unwrap(),
        );
        let embedder = OllamaEmbedding::new(client, "nomic-embed-text");

        let err = embedder.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn test_batch_size_floor() {
        let client = Arc::new(OllamaClient::new("http://localhost:1", Duration::from_secs(1)).unwrap());
        let embedder = OllamaEmbedding::new(client, "m").with_batch_size(0);
        assert_eq!(embedder.batch_size(), 1);
    }
}

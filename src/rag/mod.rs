//! RAG 오케스트레이터
//!
//! 청커, 임베딩 클라이언트, 벡터 저장소, 생성 클라이언트, 응답 파서를
//! 두 파이프라인으로 묶습니다.
//!
//! - Ingest: `Received → Chunked → Embedded → Stored → Done` (백그라운드)
//! - Query: 질문 임베딩 → top-k 검색 → 프롬프트 → 생성 → 파싱 (동기)
//!
//! 오류 정책:
//! - 백그라운드 수집의 `BackendUnavailable`은 지수 백오프로 재시도
//! - 질의는 재시도 없이 즉시 실패 (모델 확인은 검색보다 먼저)

mod error;
mod prompt;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Language, ModelIdentity, Settings};
use crate::embedding::{EmbeddingProvider, OllamaEmbedding};
use crate::knowledge::{
    boundary_chunker, chunk_id, open_vector_store, Chunker, DocumentChunk, VectorEntry,
    VectorStore,
};
use crate::llm::{parse_response, GenerationProvider, OllamaGeneration};
use crate::ollama::{BackendError, OllamaClient};

pub use error::RagError;
pub use prompt::{build_prompt, build_summary_prompt, NO_CONTEXT_MARKER};

/// 직접 입력 텍스트의 기본 source
pub const DEFAULT_TEXT_SOURCE: &str = "direct-input";

/// 파일명이 없는 업로드의 source
pub const DEFAULT_FILE_SOURCE: &str = "upload";

/// 요약 청크 source 접미사
pub const SUMMARY_SUFFIX: &str = "#summary";

/// 백엔드 TCP 연결 타임아웃
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// 백그라운드 재시도 정책
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 최대 재시도 횟수 (첫 시도 제외)
    pub max_retries: u32,
    /// 첫 재시도 전 대기 시간. 이후 2배씩 증가
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// 재시도 없음
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }

    /// `attempt`번째 재시도 전 대기 시간 (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// 오케스트레이터 옵션
#[derive(Debug, Clone)]
pub struct RagOptions {
    pub top_k: usize,
    pub default_language: Language,
    pub retry: RetryPolicy,
    pub summarize_on_ingest: bool,
}

/// 검증을 통과한 수집 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub source: String,
    pub text: String,
}

/// 수집 접수 확인 (백그라운드 작업 핸들은 노출하지 않음)
#[derive(Debug, Clone, Serialize)]
pub struct IngestTicket {
    pub job_id: Uuid,
    pub source: String,
}

/// 수집 완료 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub source: String,
    /// 저장된 청크 수 (요약 청크 포함)
    pub chunks: usize,
    pub summarized: bool,
}

/// 수집 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Chunked,
    Embedded,
    Stored,
    Done,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Received => "received",
            IngestStage::Chunked => "chunked",
            IngestStage::Embedded => "embedded",
            IngestStage::Stored => "stored",
            IngestStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// 질의 요청
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// 질의 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub thinking: Option<String>,
}

// ============================================================================
// RagService
// ============================================================================

/// RAG 오케스트레이터
///
/// 시작 시 한 번 생성되어 `Arc`로 모든 요청 핸들러가 공유합니다.
pub struct RagService {
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    store: Arc<dyn VectorStore>,
    chunker: Box<dyn Chunker>,
    options: RagOptions,
}

impl RagService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        store: Arc<dyn VectorStore>,
        chunker: Box<dyn Chunker>,
        options: RagOptions,
    ) -> Self {
        Self {
            embedder,
            generator,
            store,
            chunker,
            options,
        }
    }

    /// 설정으로부터 Ollama 클라이언트와 저장소를 열어 생성
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        settings.validate()?;

        let client = Arc::new(OllamaClient::new(&settings.ollama_host, CONNECT_TIMEOUT)?);

        let embedder = OllamaEmbedding::new(client.clone(), settings.embed_model.clone())
            .with_batch_size(settings.embed_batch_size)
            .with_timeout(settings.request_timeout());

        let generator = OllamaGeneration::new(client, settings.llm_model.clone())
            .with_timeouts(settings.request_timeout(), settings.background_timeout());

        tokio::fs::create_dir_all(&settings.persist_dir)
            .await
            .with_context(|| format!("Failed to create {}", settings.persist_dir.display()))?;
        let store = open_vector_store(settings.vector_backend, &settings.persist_dir)
            .await
            .context("Failed to open vector store")?;

        let chunker = boundary_chunker(settings.chunk_config()?)?;

        let options = RagOptions {
            top_k: settings.top_k,
            default_language: settings.default_language()?,
            retry: settings.retry_policy(),
            summarize_on_ingest: settings.summarize_on_ingest,
        };

        tracing::info!(
            "RAG service ready (embed={}, llm={}, store={}, chunker={})",
            settings.embed_model,
            settings.llm_model,
            store.name(),
            chunker.name()
        );

        Ok(Self::new(
            Arc::new(embedder),
            Arc::new(generator),
            store,
            chunker,
            options,
        ))
    }

    /// 모델 식별 정보
    pub fn models(&self) -> ModelIdentity {
        ModelIdentity {
            embed_model: self.embedder.model().to_string(),
            llm_model: self.generator.model().to_string(),
        }
    }

    /// 저장된 청크 수
    pub async fn chunk_count(&self) -> Result<usize, RagError> {
        self.store.count().await.map_err(RagError::storage)
    }

    /// 생성 모델이 백엔드에 있는지 확인
    pub async fn check_generation_model(&self) -> Result<(), RagError> {
        Ok(self.generator.ensure_model().await?)
    }

    /// 특정 source의 청크 수
    pub async fn chunk_count_for(&self, source: &str) -> Result<usize, RagError> {
        self.store.count_by_source(source).await.map_err(RagError::storage)
    }

    // ------------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------------

    /// 텍스트 입력 검증
    pub fn prepare_text(text: String, source: Option<String>) -> Result<IngestRequest, RagError> {
        if text.is_empty() {
            return Err(RagError::invalid("text must not be empty"));
        }

        let source = source
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TEXT_SOURCE.to_string());

        Ok(IngestRequest { source, text })
    }

    /// 파일 입력 검증 (UTF-8 텍스트만 허용)
    pub fn prepare_file(bytes: Vec<u8>, filename: Option<String>) -> Result<IngestRequest, RagError> {
        if bytes.is_empty() {
            return Err(RagError::invalid("file is empty"));
        }

        let text = String::from_utf8(bytes)
            .map_err(|_| RagError::invalid("File must be UTF-8 encoded text."))?;
        if text.contains('\0') {
            return Err(RagError::invalid("File looks binary (contains NUL bytes)."));
        }

        let source = filename
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_FILE_SOURCE.to_string());

        Ok(IngestRequest { source, text })
    }

    /// 텍스트 수집 접수 (검증 후 즉시 반환, 나머지는 백그라운드)
    pub fn submit_text(
        self: &Arc<Self>,
        text: String,
        source: Option<String>,
    ) -> Result<IngestTicket, RagError> {
        let request = Self::prepare_text(text, source)?;
        Ok(self.spawn_ingest(request))
    }

    /// 파일 수집 접수
    pub fn submit_file(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        filename: Option<String>,
    ) -> Result<IngestTicket, RagError> {
        let request = Self::prepare_file(bytes, filename)?;
        Ok(self.spawn_ingest(request))
    }

    /// 백그라운드 작업 생성
    ///
    /// 실패는 호출자에게 돌아가지 않고 ERROR 로그로만 남습니다.
    fn spawn_ingest(self: &Arc<Self>, request: IngestRequest) -> IngestTicket {
        let job_id = Uuid::new_v4();
        let ticket = IngestTicket {
            job_id,
            source: request.source.clone(),
        };

        let span = tracing::info_span!("ingest", job_id = %job_id, source = %request.source);
        let service = Arc::clone(self);

        tokio::spawn(
            async move {
                match service.ingest(request).await {
                    Ok(outcome) => {
                        tracing::info!(
                            chunks = outcome.chunks,
                            summarized = outcome.summarized,
                            "Background ingest finished"
                        );
                    }
                    Err(e) => {
                        tracing::error!(kind = e.kind(), error = %e, "Background ingest failed");
                    }
                }
            }
            .instrument(span),
        );

        tracing::debug!("Ingest job {} accepted", job_id);
        ticket
    }

    /// 수집 파이프라인 실행 (현재 태스크에서)
    ///
    /// 임베딩 실패 시 문서 전체를 포기하며, 청크는 한 번의 upsert로
    /// 원자적으로 보이게 됩니다.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, RagError> {
        let IngestRequest { source, text } = request;
        tracing::debug!(stage = %IngestStage::Received, bytes = text.len(), "Ingest stage");

        // 1. 청킹
        let mut chunks: Vec<DocumentChunk> = self
            .chunker
            .chunk(&text)
            .into_iter()
            .map(|span| DocumentChunk::from_span(&source, span))
            .collect();
        tracing::debug!(stage = %IngestStage::Chunked, chunks = chunks.len(), "Ingest stage");

        if chunks.is_empty() {
            tracing::debug!(stage = %IngestStage::Done, "Nothing to store");
            return Ok(IngestOutcome {
                source,
                chunks: 0,
                summarized: false,
            });
        }

        // 1-1. 선택: 요약 청크
        let mut summarized = false;
        if self.options.summarize_on_ingest {
            if let Some(summary) = self.summarize(&source, &text).await {
                // id는 요약문이 아닌 원문 기준 (재수집 시 같은 행을 덮어씀)
                let summary_source = format!("{}{}", source, SUMMARY_SUFFIX);
                chunks.push(DocumentChunk {
                    id: chunk_id(&summary_source, 0, &text),
                    text: summary,
                    source: summary_source,
                    offset: 0,
                    embedding: None,
                });
                summarized = true;
            }
        }

        // 2. 임베딩 (전부 성공하거나 전부 실패)
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedder = &self.embedder;
        let texts_ref = &texts;
        let embeddings = self
            .with_retry("embedding", move || embedder.embed(texts_ref))
            .await?;

        if embeddings.len() != chunks.len() {
            return Err(RagError::Backend(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }
        tracing::debug!(stage = %IngestStage::Embedded, "Ingest stage");

        let entries: Vec<VectorEntry> = chunks
            .into_iter()
            .filter_map(DocumentChunk::into_entry)
            .collect();

        // 3. 저장
        let stored = self.store.upsert(&entries).await.map_err(RagError::storage)?;
        tracing::debug!(stage = %IngestStage::Stored, stored, "Ingest stage");
        tracing::debug!(stage = %IngestStage::Done, "Ingest stage");

        Ok(IngestOutcome {
            source,
            chunks: stored,
            summarized,
        })
    }

    /// 문서 요약 (실패해도 수집은 계속)
    async fn summarize(&self, source: &str, text: &str) -> Option<String> {
        let prompt = build_summary_prompt(source, text);
        let generator = &self.generator;
        let prompt_ref = prompt.as_str();

        match self
            .with_retry("summary", move || generator.generate_long(prompt_ref))
            .await
        {
            Ok(raw) => {
                let summary = parse_response(&raw).answer;
                if summary.is_empty() {
                    tracing::warn!("Summary for {} was empty, skipping", source);
                    None
                } else {
                    Some(summary)
                }
            }
            Err(e) => {
                tracing::warn!("Summary for {} failed, skipping: {}", source, e);
                None
            }
        }
    }

    /// 일시적 백엔드 오류만 지수 백오프로 재시도
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RagError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let policy = &self.options.retry;
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let backoff = policy.backoff(attempt);
                    tracing::warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what,
                        e,
                        backoff,
                        attempt + 1,
                        policy.max_retries
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// 질의 파이프라인 (재시도 없음)
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResult, RagError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(RagError::invalid("question must not be empty"));
        }

        let language = match request.language.as_deref().map(str::trim) {
            Some(lang) if !lang.is_empty() => lang
                .parse::<Language>()
                .map_err(|e| RagError::invalid(e.to_string()))?,
            _ => self.options.default_language.clone(),
        };

        // 1. 모델 확인 + 질문 임베딩 (검색 전에 실패해야 함)
        self.generator.ensure_model().await?;
        let query_embedding = self.embedder.embed_one(question).await?;

        // 2. 검색
        let passages = self
            .store
            .search(&query_embedding, self.options.top_k)
            .await
            .map_err(RagError::storage)?;
        tracing::debug!("Retrieved {} passages for query", passages.len());

        // 3. 프롬프트 + 생성
        let prompt = build_prompt(question, &language, &passages);
        let raw = self.generator.generate(&prompt).await?;

        // 4. 파싱
        let parsed = parse_response(&raw);

        Ok(QueryResult {
            question: request.question,
            answer: parsed.answer,
            thinking: parsed.thinking,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

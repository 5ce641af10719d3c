//! 설정 모듈
//!
//! 시작 시 한 번 읽고 이후에는 읽기 전용으로 공유합니다.
//! 모든 값은 CLI 플래그 또는 환경변수로 지정할 수 있습니다.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use regex::Regex;
use serde::Serialize;

use crate::knowledge::ChunkConfig;
use crate::rag::RetryPolicy;

// ============================================================================
// Settings
// ============================================================================

/// 서버/CLI 공통 설정
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// 벡터 인덱스 저장 디렉토리
    #[arg(long, env = "PERSIST_DIR", default_value = "./my_rag_db", global = true)]
    pub persist_dir: PathBuf,

    /// 임베딩 모델 이름
    #[arg(long, env = "EMBED_MODEL", default_value = "nomic-embed-text", global = true)]
    pub embed_model: String,

    /// 생성 모델 이름
    #[arg(long, env = "LLM_MODEL", default_value = "qwen2.5:1.5b", global = true)]
    pub llm_model: String,

    /// 기본 응답 언어 (locale 코드)
    #[arg(long, env = "RESPONSE_LANG", default_value = "en_US", global = true)]
    pub response_lang: String,

    /// Ollama 주소
    #[arg(long, env = "OLLAMA_HOST", default_value = crate::ollama::DEFAULT_HOST, global = true)]
    pub ollama_host: String,

    /// HTTP 바인드 주소
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000", global = true)]
    pub bind: SocketAddr,

    /// 질의 시 검색할 청크 수
    #[arg(long, env = "TOP_K", default_value_t = 3, global = true)]
    pub top_k: usize,

    /// 최대 청크 크기 (문자 수)
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 500, global = true)]
    pub chunk_size: usize,

    /// 청크 오버랩 (문자 수)
    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 50, global = true)]
    pub chunk_overlap: usize,

    /// 임베딩 요청당 텍스트 수
    #[arg(long, env = "EMBED_BATCH_SIZE", default_value_t = 32, global = true)]
    pub embed_batch_size: usize,

    /// 벡터 저장소 백엔드
    #[arg(long, env = "VECTOR_BACKEND", value_enum, default_value_t = VectorBackend::Sqlite, global = true)]
    pub vector_backend: VectorBackend,

    /// 수집 시 문서 요약 청크 추가
    #[arg(long, env = "SUMMARIZE_ON_INGEST", default_value_t = false, global = true)]
    pub summarize_on_ingest: bool,

    /// 동기 백엔드 호출 타임아웃 (초)
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 120, global = true)]
    pub request_timeout_secs: u64,

    /// 백그라운드 생성 호출 타임아웃 (초)
    #[arg(long, env = "BACKGROUND_TIMEOUT_SECS", default_value_t = 600, global = true)]
    pub background_timeout_secs: u64,

    /// 백그라운드 수집 재시도 횟수
    #[arg(long, env = "INGEST_RETRIES", default_value_t = 3, global = true)]
    pub ingest_retries: u32,

    /// 재시도 초기 백오프 (ms)
    #[arg(long, env = "INGEST_BACKOFF_MS", default_value_t = 2000, global = true)]
    pub ingest_backoff_ms: u64,
}

impl Settings {
    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        self.chunk_config()?;
        if self.top_k == 0 {
            anyhow::bail!("top_k must be at least 1");
        }
        if self.embed_batch_size == 0 {
            anyhow::bail!("embed_batch_size must be at least 1");
        }
        self.default_language()
            .with_context(|| format!("Invalid RESPONSE_LANG '{}'", self.response_lang))?;
        Ok(())
    }

    pub fn chunk_config(&self) -> Result<ChunkConfig> {
        ChunkConfig::new(self.chunk_size, self.chunk_overlap)
    }

    pub fn default_language(&self) -> Result<Language> {
        self.response_lang.parse()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.ingest_retries,
            initial_backoff: Duration::from_millis(self.ingest_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }
}

/// 프로세스 전역 모델 식별 정보 (시작 후 불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelIdentity {
    pub embed_model: String,
    pub llm_model: String,
}

// ============================================================================
// VectorBackend
// ============================================================================

/// 벡터 저장소 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VectorBackend {
    /// SQLite + 정확 코사인 검색
    Sqlite,
    /// LanceDB ANN 검색
    Lance,
}

// ============================================================================
// Language
// ============================================================================

/// 검증된 locale 코드 (예: `en`, `en_US`, `ko-KR`, `zh-Hant-TW`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn locale_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z]{2,3}([_-][A-Za-z0-9]{2,8})*$").expect("valid locale regex")
    })
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if !locale_re().is_match(trimmed) {
            anyhow::bail!("'{}' is not a locale code (expected e.g. en_US, ko-KR)", s);
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

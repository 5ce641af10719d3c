//! 생성 모듈 - Ollama를 통한 텍스트 생성
//!
//! - 동기 모드: 질의 응답 (`generate`, 짧은 타임아웃)
//! - 장기 실행 모드: 수집 시 요약 (`generate_long`, 긴 타임아웃)
//!
//! 재시도는 하지 않습니다. 재시도 정책은 오케스트레이터 몫입니다.

mod parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ollama::{BackendError, OllamaClient};

pub use parser::{parse_response, ParsedResponse, THINK_CLOSE, THINK_OPEN};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(600);

// ============================================================================
// GenerationProvider Trait
// ============================================================================

/// 생성 프로바이더 트레이트
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 프롬프트 → 원시 모델 출력 (파싱 전)
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    /// 장기 실행 모드 (백그라운드 작업용)
    async fn generate_long(&self, prompt: &str) -> Result<String, BackendError> {
        self.generate(prompt).await
    }

    /// 모델이 백엔드에 등록돼 있는지 확인
    async fn ensure_model(&self) -> Result<(), BackendError>;

    /// 설정된 모델 이름
    fn model(&self) -> &str;
}

// ============================================================================
// Ollama Generation
// ============================================================================

/// Ollama `/api/generate` 요청 본문
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Ollama `/api/generate` 응답 (stream=false)
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama `/api/show` 요청 본문
#[derive(Debug, Serialize)]
struct ShowRequest<'a> {
    model: &'a str,
}

/// Ollama 생성 구현체
#[derive(Debug)]
pub struct OllamaGeneration {
    client: Arc<OllamaClient>,
    model: String,
    request_timeout: Duration,
    background_timeout: Duration,
    /// 모델 존재가 한 번 확인되면 true
    verified: AtomicBool,
}

impl OllamaGeneration {
    pub fn new(client: Arc<OllamaClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            background_timeout: DEFAULT_BACKGROUND_TIMEOUT,
            verified: AtomicBool::new(false),
        }
    }

    /// 동기/장기 실행 모드 타임아웃 지정
    pub fn with_timeouts(mut self, request: Duration, background: Duration) -> Self {
        self.request_timeout = request;
        self.background_timeout = background;
        self
    }

    async fn call(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response: GenerateResponse = self
            .client
            .post_json("/api/generate", &self.model, &request, timeout)
            .await?;

        self.verified.store(true, Ordering::Relaxed);
        Ok(response.response)
    }
}

#[async_trait]
impl GenerationProvider for OllamaGeneration {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        self.call(prompt, self.request_timeout).await
    }

    async fn generate_long(&self, prompt: &str) -> Result<String, BackendError> {
        self.call(prompt, self.background_timeout).await
    }

    async fn ensure_model(&self) -> Result<(), BackendError> {
        if self.verified.load(Ordering::Relaxed) {
            return Ok(());
        }

        let _: serde_json::Value = self
            .client
            .post_json(
                "/api/show",
                &self.model,
                &ShowRequest { model: &self.model },
                self.request_timeout,
            )
            .await?;

        self.verified.store(true, Ordering::Relaxed);
        tracing::debug!("Generation model '{}' is available", self.model);
        Ok(())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================

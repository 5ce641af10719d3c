//! Ollama 백엔드 클라이언트
//!
//! 임베딩/생성 클라이언트가 공유하는 HTTP 계층입니다.
//! 프로세스 시작 시 한 번 만들어 `Arc`로 공유합니다.
//!
//! 실패 분류:
//! - 연결 거부 / 타임아웃 → [`BackendError::Unavailable`] (일시적, 재시도 가능)
//! - 404 또는 "model not found" → [`BackendError::ModelNotFound`] (설정 오류)
//! - 그 외 비정상 응답 → [`BackendError::Backend`]

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 기본 Ollama 주소
pub const DEFAULT_HOST: &str = "http://localhost:11434";

// ============================================================================
// BackendError
// ============================================================================

/// 백엔드 호출 실패
#[derive(Debug, Error)]
pub enum BackendError {
    /// 설정된 모델이 백엔드에 없음
    #[error("model '{model}' not found on backend")]
    ModelNotFound { model: String },

    /// 백엔드에 도달할 수 없음
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    /// 기타 백엔드 오류 (비정상 상태 코드, 잘못된 응답)
    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },
}

impl BackendError {
    /// 재시도로 회복될 수 있는지
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        BackendError::Backend {
            status: 200,
            message: message.into(),
        }
    }
}

/// Ollama 에러 응답
#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

// ============================================================================
// OllamaClient
// ============================================================================

/// Ollama HTTP 클라이언트
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    /// 새 클라이언트 생성
    ///
    /// # Arguments
    /// * `base_url` - 예: `http://localhost:11434`
    /// * `connect_timeout` - TCP 연결 타임아웃
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// JSON POST 후 응답 역직렬화
    ///
    /// `model`은 404 응답을 [`BackendError::ModelNotFound`]로 바꿀 때 사용됩니다.
    pub async fn post_json<B, R>(
        &self,
        path: &str,
        model: &str,
        body: &B,
        timeout: Duration,
    ) -> std::result::Result<R, BackendError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("POST {} (model={})", url, model);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&url, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&url, e))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text, model));
        }

        serde_json::from_str(&text)
            .map_err(|e| BackendError::malformed(format!("invalid response from {}: {}", path, e)))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 전송 계층 오류 분류 (응답을 받지 못한 경우는 모두 도달 불가)
fn classify_transport(url: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Unavailable(format!("request to {} timed out", url))
    } else {
        BackendError::Unavailable(format!("cannot reach {}: {}", url, err))
    }
}

/// HTTP 상태 + 본문 분류
fn classify_status(status: u16, body: &str, model: &str) -> BackendError {
    let message = serde_json::from_str::<OllamaErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());

    let lowered = message.to_lowercase();
    if status == 404 || (lowered.contains("model") && lowered.contains("not found")) {
        return BackendError::ModelNotFound {
            model: model.to_string(),
        };
    }

    BackendError::Backend { status, message }
}

// ============================================================================
// Tests
// ============================================================================

//! RAG 파이프라인 오류 분류

use thiserror::Error;

use crate::ollama::BackendError;

/// 파이프라인 오류
///
/// 모델 출력 형식 오류는 여기에 없습니다. 파서가 항상 답변을 만들어냅니다.
#[derive(Debug, Error)]
pub enum RagError {
    /// 요청 내용 오류 (재시도 안 함, 호출자가 고쳐야 함)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// 설정된 모델이 백엔드에 없음 (재시도 안 함)
    #[error("model '{model}' is not available on the backend")]
    ModelNotFound { model: String },

    /// 백엔드 도달 불가 (일시적)
    #[error("backend unreachable: {0}")]
    BackendUnavailable(String),

    /// 기타 백엔드 오류
    #[error("backend error: {0}")]
    Backend(String),

    /// 벡터 저장소 오류
    #[error("storage error: {0}")]
    Storage(String),
}

impl RagError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RagError::InvalidInput(message.into())
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        RagError::Storage(format!("{:#}", err))
    }

    /// 로그/응답용 짧은 분류 이름
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::InvalidInput(_) => "invalid_input",
            RagError::ModelNotFound { .. } => "model_not_found",
            RagError::BackendUnavailable(_) => "backend_unavailable",
            RagError::Backend(_) => "backend_error",
            RagError::Storage(_) => "storage_error",
        }
    }
}

impl From<BackendError> for RagError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ModelNotFound { model } => RagError::ModelNotFound { model },
            BackendError::Unavailable(message) => RagError::BackendUnavailable(message),
            other @ BackendError::Backend { .. } => RagError::Backend(other.to_string()),
        }
    }
}

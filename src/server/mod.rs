//! HTTP 서버 (axum)
//!
//! 오케스트레이터 앞단의 얇은 어댑터입니다. 요청 검증과 파이프라인 로직은
//! 모두 [`RagService`]에 있고, 여기서는 JSON 변환과 상태 코드 매핑만 합니다.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Settings;
use crate::rag::{IngestTicket, QueryRequest, QueryResult, RagError, RagService};

// ============================================================================
// Errors
// ============================================================================

/// HTTP 오류 응답
#[derive(Debug)]
pub struct ApiError(RagError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            RagError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Backend(_) => StatusCode::BAD_GATEWAY,
            RagError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        Self(err)
    }
}

// 본문 파싱 실패도 같은 400 형식으로
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(RagError::invalid(rejection.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self(RagError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed ({}): {}", status, self.0);
        }

        let body = Json(json!({ "error": self.0.to_string(), "kind": self.0.kind() }));
        (status, body).into_response()
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestAccepted {
    pub status: &'static str,
    pub message: String,
    pub job_id: Uuid,
    pub source: String,
}

impl IngestAccepted {
    fn new(ticket: IngestTicket, message: String) -> Self {
        Self {
            status: "accepted",
            message,
            job_id: ticket.job_id,
            source: ticket.source,
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// 라우터 생성
pub fn router(service: Arc<RagService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest_text))
        .route("/ingest/file", post(ingest_file))
        .route("/query", post(query))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// 설정대로 서비스를 만들고 바인드 주소에서 서빙 (Ctrl+C까지)
pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let service = Arc::new(RagService::from_settings(settings).await?);

    let listener = TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(service): State<Arc<RagService>>) -> impl IntoResponse {
    let models = service.models();
    Json(json!({
        "status": "ok",
        "embed_model": models.embed_model,
        "llm_model": models.llm_model,
    }))
}

async fn ingest_text(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<IngestBody>, JsonRejection>,
) -> Result<Json<IngestAccepted>, ApiError> {
    let Json(body) = payload?;
    let ticket = service.submit_text(body.text, body.source)?;
    Ok(Json(IngestAccepted::new(
        ticket,
        "Ingest started in background.".to_string(),
    )))
}

async fn ingest_file(
    State(service): State<Arc<RagService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<IngestAccepted>, ApiError> {
    let mut multipart = multipart?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RagError::invalid(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RagError::invalid(format!("failed to read upload: {}", e)))?;

        let ticket = service.submit_file(bytes.to_vec(), filename)?;
        let message = format!("Ingest of '{}' started in background.", ticket.source);
        return Ok(Json(IngestAccepted::new(ticket, message)));
    }

    Err(RagError::invalid("multipart field 'file' is required").into())
}

async fn query(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResult>, ApiError> {
    let Json(request) = payload?;
    Ok(Json(service.query(request).await?))
}

async fn stats(State(service): State<Arc<RagService>>) -> Result<impl IntoResponse, ApiError> {
    let chunks = service.chunk_count().await?;
    Ok(Json(json!({ "chunks": chunks })))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::Value;

    use crate::embedding::OllamaEmbedding;
    use crate::knowledge::default_chunker;
    use crate::llm::OllamaGeneration;
    use crate::rag::{RagOptions, RetryPolicy};
    use crate::testing::{spawn_fake_ollama, FakeOllamaState, MemoryStore, MISSING_MODEL};

    async fn spawn_app(llm_model: &str) -> (SocketAddr, Arc<FakeOllamaState>) {
        let (client, state) = spawn_fake_ollama().await;

        let service = RagService::new(
            Arc::new(OllamaEmbedding::new(client.clone(), "nomic-embed-text")),
            Arc::new(OllamaGeneration::new(client, llm_model)),
            Arc::new(MemoryStore::default()),
            default_chunker(),
            RagOptions {
                top_k: 3,
                default_language: "en_US".parse().unwrap(),
                retry: RetryPolicy::none(),
                summarize_on_ingest: false,
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(service));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state)
    }

    async fn wait_for_chunks(http: &reqwest::Client, addr: SocketAddr) -> u64 {
        for _ in 0..100 {
            let stats: Value = http
                .get(format!("http://{}/stats", addr))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let chunks = stats["chunks"].as_u64().unwrap();
            if chunks > 0 {
                return chunks;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (RagError::invalid("x"), StatusCode::BAD_REQUEST),
            (
                RagError::ModelNotFound { model: "m".into() },
                StatusCode::NOT_FOUND,
            ),
            (
                RagError::BackendUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (RagError::Backend("bad".into()), StatusCode::BAD_GATEWAY),
            (
                RagError::Storage("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;

        let body: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["llm_model"], "qwen2.5:1.5b");
        assert_eq!(body["embed_model"], "nomic-embed-text");
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let (addr, state) = spawn_app("qwen2.5:1.5b").await;
        let http = reqwest::Client::new();

        let response = http
            .post(format!("http://{}/ingest", addr))
            .json(&json!({
                "text": "LangChain is a framework for building LLM applications",
                "source": "doc1"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["message"], "Ingest started in background.");
        assert_eq!(body["source"], "doc1");
        assert!(body["job_id"].as_str().is_some());

        assert_eq!(wait_for_chunks(&http, addr).await, 1);

        let response = http
            .post(format!("http://{}/query", addr))
            .json(&json!({ "question": "What is LangChain?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["question"], "What is LangChain?");
        assert_eq!(body["answer"], "Answer from the fake model.");
        assert_eq!(body["thinking"], "checking the context");

        let prompt = state.last_prompt().unwrap();
        assert!(prompt.contains("[1] LangChain is a framework"));
    }

    #[tokio::test]
    async fn test_ingest_empty_text_is_bad_request() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/ingest", addr))
            .json(&json!({ "text": "" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_ingest_file_upload() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;
        let http = reqwest::Client::new();

        let part = reqwest::multipart::Part::bytes(b"Notes about Rust.".to_vec()).file_name("notes.txt");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = http
            .post(format!("http://{}/ingest/file", addr))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["source"], "notes.txt");
        assert_eq!(body["message"], "Ingest of 'notes.txt' started in background.");

        assert_eq!(wait_for_chunks(&http, addr).await, 1);
    }

    #[tokio::test]
    async fn test_ingest_file_rejects_non_utf8() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;

        let part = reqwest::multipart::Part::bytes(vec![0xff, 0xfe, 0xfd]).file_name("blob.bin");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = reqwest::Client::new()
            .post(format!("http://{}/ingest/file", addr))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid input: File must be UTF-8 encoded text.");
    }

    #[tokio::test]
    async fn test_query_missing_model_is_not_found() {
        let (addr, state) = spawn_app(MISSING_MODEL).await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/query", addr))
            .json(&json!({ "question": "What is LangChain?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "model_not_found");

        // 검색 전에 실패: 질문 임베딩도 하지 않음
        assert_eq!(state.embed_calls(), 0);
        assert_eq!(state.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;
        let http = reqwest::Client::new();

        for (path, body) in [
            ("/query", json!({})),
            ("/ingest", json!({})),
            ("/ingest", json!({ "txt": "x" })),
        ] {
            let response = http
                .post(format!("http://{}{}", addr, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 400, "{} {}", path, body);
            let reply: Value = response.json().await.unwrap();
            assert_eq!(reply["kind"], "invalid_input");
        }

        // JSON이 아닌 본문
        let response = http
            .post(format!("http://{}/query", addr))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let reply: Value = response.json().await.unwrap();
        assert_eq!(reply["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_ingest_file_without_multipart_is_bad_request() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/ingest/file", addr))
            .json(&json!({ "text": "not a form" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let reply: Value = response.json().await.unwrap();
        assert_eq!(reply["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_query_invalid_language() {
        let (addr, _state) = spawn_app("qwen2.5:1.5b").await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/query", addr))
            .json(&json!({ "question": "hi", "language": "nope nope" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }
}

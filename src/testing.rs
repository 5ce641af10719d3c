//! 테스트 지원 - 가짜 Ollama 서버와 인메모리 구현체

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::embedding::EmbeddingProvider;
use crate::knowledge::{cosine_similarity, rank_by_similarity, SearchResult, VectorEntry, VectorStore};
use crate::llm::GenerationProvider;
use crate::ollama::{BackendError, OllamaClient};

/// 가짜 서버가 404로 응답하는 모델 이름
pub const MISSING_MODEL: &str = "missing-model";

/// 가짜 서버의 생성 응답
pub const FAKE_GENERATION: &str = "<think>checking the context</think>Answer from the fake model.";

/// 텍스트별 결정적 벡터
pub fn fake_vector(text: &str) -> Vec<f32> {
    let byte_sum: u32 = text.bytes().map(u32::from).sum();
    vec![text.len() as f32 + 1.0, (byte_sum % 97) as f32, 1.0]
}

// ============================================================================
// Fake Ollama
// ============================================================================

/// 가짜 Ollama 호출 기록
#[derive(Default)]
pub struct FakeOllamaState {
    embed_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    show_calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl FakeOllamaState {
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn show_calls(&self) -> usize {
        self.show_calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }
}

fn model_of(body: &Value) -> &str {
    body["model"].as_str().unwrap_or_default()
}

fn model_not_found(model: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("model \"{}\" not found, try pulling it first", model) })),
    )
        .into_response()
}

async fn fake_embed(State(state): State<Arc<FakeOllamaState>>, Json(body): Json<Value>) -> Response {
    state.embed_calls.fetch_add(1, Ordering::SeqCst);
    let model = model_of(&body);
    if model == MISSING_MODEL {
        return model_not_found(model);
    }

    let embeddings: Vec<Vec<f32>> = body["input"]
        .as_array()
        .map(|items| items.iter().map(|v| fake_vector(v.as_str().unwrap_or_default())).collect())
        .unwrap_or_default();

    Json(json!({ "model": model, "embeddings": embeddings })).into_response()
}

async fn fake_generate(State(state): State<Arc<FakeOllamaState>>, Json(body): Json<Value>) -> Response {
    state.generate_calls.fetch_add(1, Ordering::SeqCst);
    let model = model_of(&body);
    if model == MISSING_MODEL {
        return model_not_found(model);
    }

    *state.last_prompt.lock().unwrap() = body["prompt"].as_str().map(str::to_string);
    Json(json!({ "model": model, "response": FAKE_GENERATION, "done": true })).into_response()
}

async fn fake_show(State(state): State<Arc<FakeOllamaState>>, Json(body): Json<Value>) -> Response {
    state.show_calls.fetch_add(1, Ordering::SeqCst);
    let model = model_of(&body);
    if model == MISSING_MODEL {
        return model_not_found(model);
    }

    Json(json!({ "modelfile": "", "details": { "family": "fake" } })).into_response()
}

/// 127.0.0.1 임의 포트에 가짜 Ollama 서버를 띄움
pub async fn spawn_fake_ollama() -> (Arc<OllamaClient>, Arc<FakeOllamaState>) {
    let state = Arc::new(FakeOllamaState::default());

    let app = Router::new()
        .route("/api/embed", post(fake_embed))
        .route("/api/generate", post(fake_generate))
        .route("/api/show", post(fake_show))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = OllamaClient::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();
    (Arc::new(client), state)
}

// ============================================================================
// In-memory fakes
// ============================================================================

const KEYWORD_DIMENSION: usize = 64;

/// 단어 해시 기반 임베더
///
/// 같은 단어를 공유하는 텍스트끼리 유사도가 높습니다.
#[derive(Default)]
pub struct KeywordEmbedder {
    calls: AtomicUsize,
    /// 남은 일시적 실패 횟수
    transient_failures: AtomicUsize,
    missing: bool,
}

impl KeywordEmbedder {
    /// 처음 `failures`번은 `Unavailable`로 실패
    pub fn flaky(failures: usize) -> Self {
        Self {
            transient_failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn missing_model() -> Self {
        Self {
            missing: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; KEYWORD_DIMENSION + 1];
        // 단어가 없는 텍스트도 영벡터가 되지 않도록
        vector[KEYWORD_DIMENSION] = 0.01;

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
            vector[bucket % KEYWORD_DIMENSION] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.missing {
            return Err(BackendError::ModelNotFound {
                model: MISSING_MODEL.to_string(),
            });
        }

        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }

        Ok(texts.iter().map(|t| Self::vectorize(t)).collect())
    }

    fn model(&self) -> &str {
        "keyword-embedder"
    }
}

/// 고정 응답 생성기
pub struct ScriptedGenerator {
    response: String,
    /// true면 응답 뒤에 호출 번호(1부터)를 붙임
    varying: bool,
    missing: bool,
    generate_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn answering(response: &str) -> Self {
        Self {
            response: response.to_string(),
            varying: false,
            missing: false,
            generate_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn missing_model() -> Self {
        Self {
            missing: true,
            ..Self::answering("")
        }
    }

    /// 호출마다 다른 출력 (`"{prefix} 1"`, `"{prefix} 2"`, ...)
    pub fn varying(prefix: &str) -> Self {
        Self {
            varying: true,
            ..Self::answering(prefix)
        }
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    fn not_found(&self) -> BackendError {
        BackendError::ModelNotFound {
            model: MISSING_MODEL.to_string(),
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.missing {
            return Err(self.not_found());
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.varying {
            return Ok(format!("{} {}", self.response, call));
        }
        Ok(self.response.clone())
    }

    async fn ensure_model(&self) -> Result<(), BackendError> {
        if self.missing {
            return Err(self.not_found());
        }
        Ok(())
    }

    fn model(&self) -> &str {
        "scripted-generator"
    }
}

/// 호출 수를 세는 인메모리 벡터 저장소
#[derive(Default)]
pub struct MemoryStore {
    /// id → (seq, entry)
    entries: Mutex<HashMap<String, (i64, VectorEntry)>>,
    next_seq: AtomicUsize,
    upsert_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// 삽입 순서대로 정렬된 id 목록
    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let mut ordered: Vec<(i64, String)> = entries
            .iter()
            .map(|(id, (seq, _))| (*seq, id.clone()))
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, id)| id).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        entries.values().map(|(_, e)| e.text.clone()).collect()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.entries.lock().unwrap();

        for entry in entries {
            let seq = match stored.get(&entry.id) {
                Some((seq, _)) => *seq,
                None => self.next_seq.fetch_add(1, Ordering::SeqCst) as i64,
            };
            stored.insert(entry.id.clone(), (seq, entry.clone()));
        }
        Ok(entries.len())
    }

    async fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let stored = self.entries.lock().unwrap();

        let scored = stored
            .values()
            .filter(|(_, e)| e.embedding.len() == query_embedding.len())
            .map(|(seq, e)| {
                (
                    *seq,
                    SearchResult {
                        id: e.id.clone(),
                        source: e.source.clone(),
                        offset: e.offset,
                        text: e.text.clone(),
                        similarity: cosine_similarity(query_embedding, &e.embedding),
                    },
                )
            })
            .collect();

        Ok(rank_by_similarity(scored, k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.lock().unwrap().len())
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        let stored = self.entries.lock().unwrap();
        Ok(stored.values().filter(|(_, e)| e.source == source).count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

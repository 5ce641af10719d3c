//! Chunk Store - rusqlite 기반 벡터 저장소
//!
//! 청크 텍스트, 메타데이터, 임베딩을 한 행에 저장하고
//! 정확한(brute-force) 코사인 유사도로 검색합니다.
//! 저장 위치: {persist_dir}/chunks.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};

use super::vector::{cosine_similarity, rank_by_similarity, SearchResult, VectorEntry, VectorStore};

/// DB 파일 이름
pub const DB_FILE_NAME: &str = "chunks.db";

// ============================================================================
// SqliteVectorStore
// ============================================================================

/// SQLite 벡터 저장소
///
/// 연결 하나를 `Mutex`로 공유합니다. 모든 DB 작업은 `spawn_blocking`에서
/// 실행되어 async 워커를 막지 않습니다.
#[derive(Clone)]
pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteVectorStore {
    /// 저장소 열기 (없으면 생성)
    ///
    /// # Arguments
    /// * `path` - DB 파일 경로
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 영속 디렉토리 안에서 열기 ({dir}/chunks.db)
    pub fn open_in(dir: &Path) -> Result<Self> {
        Self::open(&dir.join(DB_FILE_NAME))
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        // seq: 삽입 순서 (동점 정렬 기준). upsert로 교체돼도 유지됨
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                byte_offset INTEGER NOT NULL,
                text TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create chunks table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)",
            [],
        )
        .context("Failed to create source index")?;

        tracing::debug!("Chunk store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 동기 upsert (단일 트랜잭션)
    fn upsert_blocking(&self, entries: &[VectorEntry]) -> Result<usize> {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let now = Utc::now().to_rfc3339();

        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, source, byte_offset, text, dimension, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    source = excluded.source,
                    byte_offset = excluded.byte_offset,
                    text = excluded.text,
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at",
            )?;

            for entry in entries {
                stmt.execute(params![
                    entry.id,
                    entry.source,
                    entry.offset as i64,
                    entry.text,
                    entry.embedding.len() as i64,
                    encode_embedding(&entry.embedding),
                    now,
                ])
                .with_context(|| format!("Failed to upsert chunk {}", entry.id))?;
            }
        }
        tx.commit().context("Failed to commit chunk batch")?;

        Ok(entries.len())
    }

    /// 동기 검색
    fn search_blocking(&self, query_embedding: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT seq, id, source, byte_offset, text, embedding FROM chunks WHERE dimension = ?1",
        )?;

        let rows = stmt.query_map(params![query_embedding.len() as i64], |row| {
            let seq: i64 = row.get(0)?;
            let embedding: Vec<u8> = row.get(5)?;
            let result = SearchResult {
                id: row.get(1)?,
                source: row.get(2)?,
                offset: row.get::<_, i64>(3)? as usize,
                text: row.get(4)?,
                similarity: cosine_similarity(query_embedding, &decode_embedding(&embedding)),
            };
            Ok((seq, result))
        })?;

        let scored = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read chunk rows")?;

        Ok(rank_by_similarity(scored, k))
    }

    fn count_blocking(&self, source: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let count: i64 = match source {
            Some(source) => conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?,
        };

        Ok(count as usize)
    }

    /// 특정 source의 청크 ID 목록 (삽입 순)
    pub fn ids_by_source(&self, source: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare("SELECT id FROM chunks WHERE source = ?1 ORDER BY seq")?;
        let ids = stmt
            .query_map(params![source], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        Ok(ids)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let store = self.clone();
        let entries = entries.to_vec();
        tokio::task::spawn_blocking(move || store.upsert_blocking(&entries))
            .await
            .context("Upsert task panicked")?
    }

    async fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 || query_embedding.is_empty() {
            return Ok(vec![]);
        }

        let store = self.clone();
        let query = query_embedding.to_vec();
        tokio::task::spawn_blocking(move || store.search_blocking(&query, k))
            .await
            .context("Search task panicked")?
    }

    async fn count(&self) -> Result<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.count_blocking(None))
            .await
            .context("Count task panicked")?
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        let store = self.clone();
        let source = source.to_string();
        tokio::task::spawn_blocking(move || store.count_blocking(Some(&source)))
            .await
            .context("Count task panicked")?
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// f32 벡터 → little-endian 바이트
fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// little-endian 바이트 → f32 벡터
fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

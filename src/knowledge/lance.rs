//! LanceDB Vector Store - ANN 벡터 검색 백엔드
//!
//! 대용량 인덱스에서는 SQLite 전수 검색 대신 이 백엔드를 사용합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::table::Table;
use lancedb::DistanceType;
use tokio::sync::Mutex;

use super::vector::{rank_by_similarity, SearchResult, VectorEntry, VectorStore};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunks";

/// 디렉토리 이름
pub const LANCE_DIR_NAME: &str = "vectors.lance";

/// 첫 조회에서 k개보다 더 가져오는 개수 (경계 동점이면 조회 범위를 넓힘)
const TIE_MARGIN: usize = 4;

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
///
/// 쓰기는 `write_lock`으로 직렬화됩니다 (seq 할당 + merge_insert).
/// 읽기는 LanceDB의 스냅샷 격리에 맡깁니다.
pub struct LanceVectorStore {
    db: Connection,
    write_lock: Mutex<Option<i64>>,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            db,
            write_lock: Mutex::new(None),
        })
    }

    /// 영속 디렉토리 안에서 열기 ({dir}/vectors.lance)
    pub async fn open_in(dir: &Path) -> Result<Self> {
        Self::open(&dir.join(LANCE_DIR_NAME)).await
    }

    /// 벡터 테이블 스키마 생성
    fn create_schema(dimension: i32) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("byte_offset", DataType::Int64, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("seq", DataType::Int64, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(entries: &[VectorEntry], seqs: &[i64], dimension: i32) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let sources: Vec<&str> = entries.iter().map(|e| e.source.as_str()).collect();
        let offsets: Vec<i64> = entries.iter().map(|e| e.offset as i64).collect();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            dimension,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(Self::create_schema(dimension)),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(sources)),
                Arc::new(Int64Array::from(offsets)),
                Arc::new(StringArray::from(texts)),
                Arc::new(Int64Array::from(seqs.to_vec())),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")?;

        Ok(batch)
    }

    /// 테이블 존재 여부 확인
    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.contains(&TABLE_NAME.to_string()))
            .unwrap_or(false)
    }

    async fn open_table(&self) -> Result<Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open table")
    }

    /// 저장된 임베딩 차원
    async fn table_dimension(table: &Table) -> Result<Option<i32>> {
        let schema = table.schema().await.context("Failed to read table schema")?;
        let dimension = schema
            .field_with_name("embedding")
            .ok()
            .and_then(|f| match f.data_type() {
                DataType::FixedSizeList(_, n) => Some(*n),
                _ => None,
            });
        Ok(dimension)
    }

    /// 이미 저장된 id → seq 매핑
    async fn existing_seqs(table: &Table, ids: &[&str]) -> Result<HashMap<String, i64>> {
        let list = ids
            .iter()
            .map(|id| format!("'{}'", escape_literal(id)))
            .collect::<Vec<_>>()
            .join(", ");

        let batches: Vec<RecordBatch> = table
            .query()
            .only_if(format!("id IN ({})", list))
            .select(Select::columns(&["id", "seq"]))
            .execute()
            .await
            .context("Failed to query existing ids")?
            .try_collect()
            .await?;

        let mut seqs = HashMap::new();
        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let values = int64_column(&batch, "seq")?;
            for i in 0..batch.num_rows() {
                seqs.insert(ids.value(i).to_string(), values.value(i));
            }
        }
        Ok(seqs)
    }

    /// 다음 seq 값 (테이블의 최대 seq + 1)
    async fn scan_next_seq(table: &Table) -> Result<i64> {
        let batches: Vec<RecordBatch> = table
            .query()
            .select(Select::columns(&["seq"]))
            .execute()
            .await
            .context("Failed to scan seq column")?
            .try_collect()
            .await?;

        let mut max = -1;
        for batch in batches {
            let values = int64_column(&batch, "seq")?;
            for i in 0..batch.num_rows() {
                max = max.max(values.value(i));
            }
        }
        Ok(max + 1)
    }

    /// 코사인 거리 기준 최근접 `limit`개 (seq, 결과)
    async fn nearest(table: &Table, query_embedding: &[f32], limit: usize) -> Result<Vec<(i64, SearchResult)>> {
        let batches: Vec<RecordBatch> = table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .context("Failed to execute vector search")?
            .try_collect()
            .await?;

        let mut scored = Vec::new();
        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let sources = string_column(&batch, "source")?;
            let offsets = int64_column(&batch, "byte_offset")?;
            let texts = string_column(&batch, "text")?;
            let seqs = int64_column(&batch, "seq")?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                // 코사인 거리 → 코사인 유사도
                let similarity = 1.0 - distances.value(i);
                scored.push((
                    seqs.value(i),
                    SearchResult {
                        id: ids.value(i).to_string(),
                        source: sources.value(i).to_string(),
                        offset: offsets.value(i) as usize,
                        text: texts.value(i).to_string(),
                        similarity,
                    },
                ));
            }
        }
        Ok(scored)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        // 같은 배치 안의 중복 id는 마지막 것만 사용
        let mut deduped: Vec<VectorEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(pos) = deduped.iter().position(|e| e.id == entry.id) {
                deduped[pos] = entry.clone();
            } else {
                deduped.push(entry.clone());
            }
        }

        let dimension = deduped[0].embedding.len();
        if dimension == 0 || deduped.iter().any(|e| e.embedding.len() != dimension) {
            anyhow::bail!("All embeddings in a batch must share one non-zero dimension");
        }
        let dimension = i32::try_from(dimension).context("Embedding dimension too large")?;

        let mut next_seq = self.write_lock.lock().await;

        if !self.table_exists().await {
            let seqs: Vec<i64> = (0..deduped.len() as i64).collect();
            let batch = Self::entries_to_batch(&deduped, &seqs, dimension)?;
            let schema = batch.schema();
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .context("Failed to create table")?;
            *next_seq = Some(deduped.len() as i64);
            return Ok(deduped.len());
        }

        let table = self.open_table().await?;
        if let Some(stored) = Self::table_dimension(&table).await? {
            if stored != dimension {
                anyhow::bail!(
                    "Embedding dimension {} does not match index dimension {}",
                    dimension,
                    stored
                );
            }
        }

        let mut seq = match *next_seq {
            Some(seq) => seq,
            None => Self::scan_next_seq(&table).await?,
        };

        let ids: Vec<&str> = deduped.iter().map(|e| e.id.as_str()).collect();
        let existing = Self::existing_seqs(&table, &ids).await?;
        let seqs: Vec<i64> = deduped
            .iter()
            .map(|e| match existing.get(&e.id) {
                Some(&s) => s,
                None => {
                    let s = seq;
                    seq += 1;
                    s
                }
            })
            .collect();

        let batch = Self::entries_to_batch(&deduped, &seqs, dimension)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .context("Failed to merge vectors into table")?;

        *next_seq = Some(seq);
        Ok(deduped.len())
    }

    async fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 || query_embedding.is_empty() || !self.table_exists().await {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;
        match Self::table_dimension(&table).await? {
            Some(dim) if dim as usize == query_embedding.len() => {}
            _ => return Ok(vec![]),
        }

        // k번째 점수와 동점인 행이 limit 밖에 남아 있을 수 있으면 limit을 늘려 다시 조회
        let mut limit = k + TIE_MARGIN;
        loop {
            let scored = Self::nearest(&table, query_embedding, limit).await?;
            if scored.len() < limit || !boundary_tied(&scored, k) {
                return Ok(rank_by_similarity(scored, k));
            }
            tracing::debug!("Tie at rank {} spans the fetch limit {}, widening", k, limit);
            limit *= 2;
        }
    }

    async fn count(&self) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }

        let table = self.open_table().await?;
        let count = table.count_rows(None).await.context("Failed to count rows")?;
        Ok(count)
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        if !self.table_exists().await {
            return Ok(0);
        }

        let table = self.open_table().await?;
        let filter = format!("source = '{}'", escape_literal(source));
        let count = table
            .count_rows(Some(filter))
            .await
            .context("Failed to count rows for source")?;
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "lance"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 가져온 행 중 가장 낮은 점수가 k번째 점수와 같은지
///
/// 같다면 잘린 행 중에도 k번째와 동점인 행이 있을 수 있습니다.
fn boundary_tied(scored: &[(i64, SearchResult)], k: usize) -> bool {
    if scored.len() < k {
        return false;
    }

    let mut similarities: Vec<f32> = scored.iter().map(|(_, r)| r.similarity).collect();
    similarities.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    similarities[k - 1] <= similarities[similarities.len() - 1]
}

/// SQL 문자열 리터럴 이스케이프 (작은따옴표 중복)
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

// ============================================================================
// Tests
// ============================================================================

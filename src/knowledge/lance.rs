//! LanceDB Vector Index - 로컬 영구 벡터 저장소
//!
//! 문서 본문, 출처, 타임스탬프, 임베딩을 한 테이블에 저장하고
//! 코사인 거리로 ANN 검색을 수행합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::{Path, PathBuf};
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
use lancedb::DistanceType;

use super::vector::{Document, IndexHit, StoredMetadata, VectorIndex};

// ============================================================================
// LanceVectorIndex
// ============================================================================

/// LanceDB 벡터 인덱스 구현
///
/// 테이블 이름은 컬렉션 이름과 같습니다. 테이블은 첫 삽입 시 생성됩니다.
pub struct LanceVectorIndex {
    db: Connection,
    table_name: String,
    dimension: i32,
    path: PathBuf,
}

impl LanceVectorIndex {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `table_name` - 컬렉션(테이블) 이름
    /// * `dimension` - 임베딩 차원
    pub async fn open(path: &Path, table_name: &str, dimension: usize) -> Result<Self> {
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

        let dimension = i32::try_from(dimension).context("Embedding dimension too large")?;

        Ok(Self {
            db,
            table_name: table_name.to_string(),
            dimension,
            path: path.to_path_buf(),
        })
    }

    /// 테이블 스키마
    fn create_schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("timestamp", DataType::Utf8, false),
            Field::new("length", DataType::Int64, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension,
                ),
                false,
            ),
        ])
    }

    /// 문서들을 Arrow RecordBatch로 변환
    fn documents_to_batch(&self, documents: &[Document]) -> Result<RecordBatch> {
        if documents.is_empty() {
            anyhow::bail!("Cannot create batch from empty documents");
        }

        if let Some(bad) = documents
            .iter()
            .find(|d| d.embedding.len() != self.dimension as usize)
        {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                bad.embedding.len()
            );
        }

        let ids: Vec<String> = documents.iter().map(|d| d.id.to_string()).collect();
        let texts: Vec<&str> = documents.iter().map(|d| d.text.as_str()).collect();
        let sources: Vec<&str> = documents.iter().map(|d| d.source.as_str()).collect();
        let timestamps: Vec<&str> = documents.iter().map(|d| d.timestamp.as_str()).collect();
        let lengths: Vec<i64> = documents
            .iter()
            .map(|d| d.text.chars().count() as i64)
            .collect();

        let embeddings_flat: Vec<f32> = documents
            .iter()
            .flat_map(|d| d.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        let batch = RecordBatch::try_new(
            Arc::new(self.create_schema()),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(sources)),
                Arc::new(StringArray::from(timestamps)),
                Arc::new(Int64Array::from(lengths)),
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
            .map(|names| names.contains(&self.table_name))
            .unwrap_or(false)
    }

    /// 테이블 열기 (없으면 `None`)
    async fn open_table(&self) -> Result<Option<lancedb::table::Table>> {
        if !self.table_exists().await {
            return Ok(None);
        }

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open table")?;

        Ok(Some(table))
    }
}

/// 배치에서 문자열 컬럼 추출
fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

/// SQL 문자열 리터럴 이스케이프
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn upsert(&self, documents: &[Document]) -> Result<Vec<String>> {
        if documents.is_empty() {
            return Ok(vec![]);
        }

        let batch = self.documents_to_batch(documents)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                table
                    .add(batches)
                    .execute()
                    .await
                    .context("Failed to add documents to table")?;
            }
            None => {
                self.db
                    .create_table(&self.table_name, batches)
                    .execute()
                    .await
                    .context("Failed to create table")?;
            }
        }

        Ok(documents.iter().map(|d| d.id.to_string()).collect())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let stream = table
            .vector_search(embedding.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let mut hits = Vec::new();

        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let texts = string_column(&batch, "text")?;
            let sources = string_column(&batch, "source")?;
            let timestamps = string_column(&batch, "timestamp")?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                hits.push(IndexHit {
                    id: ids.value(i).to_string(),
                    text: texts.value(i).to_string(),
                    source: sources.value(i).to_string(),
                    timestamp: timestamps.value(i).to_string(),
                    distance: distances.value(i),
                });
            }
        }

        // 결과는 거리 오름차순
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(hits)
    }

    async fn get_all(&self) -> Result<Vec<StoredMetadata>> {
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let stream = table
            .query()
            .select(Select::columns(&["id", "source", "timestamp"]))
            .execute()
            .await
            .context("Failed to scan table")?;

        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let mut all = Vec::new();

        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let sources = string_column(&batch, "source")?;
            let timestamps = string_column(&batch, "timestamp")?;

            for i in 0..batch.num_rows() {
                all.push(StoredMetadata {
                    id: ids.value(i).to_string(),
                    source: sources.value(i).to_string(),
                    timestamp: timestamps.value(i).to_string(),
                });
            }
        }

        Ok(all)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let before = table.count_rows(None).await.context("Failed to count rows")?;

        let list = ids
            .iter()
            .map(|id| quote_literal(id))
            .collect::<Vec<_>>()
            .join(", ");
        table
            .delete(&format!("id IN ({})", list))
            .await
            .context("Failed to delete documents")?;

        let after = table.count_rows(None).await.context("Failed to count rows")?;
        Ok(before.saturating_sub(after))
    }

    async fn delete_all(&self) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let before = table.count_rows(None).await.context("Failed to count rows")?;
        table
            .delete("true")
            .await
            .context("Failed to delete all documents")?;

        Ok(before)
    }

    async fn count(&self) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        table.count_rows(None).await.context("Failed to count rows")
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    const DIM: usize = 8;

    fn create_test_document(text: &str, source: &str, timestamp: &str, hot: usize) -> Document {
        let mut embedding = vec![0.01; DIM];
        embedding[hot % DIM] = 1.0;
        Document {
            id: Uuid::new_v4(),
            text: text.to_string(),
            source: source.to_string(),
            timestamp: timestamp.to_string(),
            embedding,
        }
    }

    async fn open_test_index(dir: &TempDir) -> LanceVectorIndex {
        let path = dir.path().join("test.lance");
        LanceVectorIndex::open(&path, "documents", DIM).await.unwrap()
    }

    #[tokio::test]
    async fn test_lance_index_basic() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_test_index(&temp_dir).await;

        // 초기 상태
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.get_all().await.unwrap().is_empty());

        let docs = vec![
            create_test_document("first document body", "manual", "2024-01-01T00:00:00.000000Z", 0),
            create_test_document("second document body", "web_auto", "2024-02-01T00:00:00.000000Z", 1),
        ];
        let ids = index.upsert(&docs).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(index.count().await.unwrap(), 2);

        let all = index.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|m| m.source == "web_auto"));
    }

    #[tokio::test]
    async fn test_lance_query_cosine() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_test_index(&temp_dir).await;

        let docs = vec![
            create_test_document("alpha", "manual", "2024-01-01T00:00:00.000000Z", 0),
            create_test_document("beta", "manual", "2024-01-01T00:00:00.000000Z", 3),
            create_test_document("gamma", "manual", "2024-01-01T00:00:00.000000Z", 5),
        ];
        index.upsert(&docs).await.unwrap();

        let hits = index.query(&docs[1].embedding, 2).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.len() <= 2);
        assert_eq!(hits[0].text, "beta");
        assert!(hits[0].distance.abs() < 0.001);
    }

    #[tokio::test]
    async fn test_lance_delete_by_ids() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_test_index(&temp_dir).await;

        let docs = vec![
            create_test_document("one", "manual", "2024-01-01T00:00:00.000000Z", 0),
            create_test_document("two", "manual", "2024-01-01T00:00:00.000000Z", 1),
            create_test_document("three", "manual", "2024-01-01T00:00:00.000000Z", 2),
        ];
        let ids = index.upsert(&docs).await.unwrap();

        let deleted = index.delete_by_ids(&ids[..2]).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lance_delete_all() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_test_index(&temp_dir).await;

        assert_eq!(index.delete_all().await.unwrap(), 0);

        let docs = vec![
            create_test_document("one", "manual", "2024-01-01T00:00:00.000000Z", 0),
            create_test_document("two", "web_auto", "2024-01-01T00:00:00.000000Z", 1),
        ];
        index.upsert(&docs).await.unwrap();

        assert_eq!(index.delete_all().await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 0);

        // 비운 뒤에도 다시 쓸 수 있어야 함
        index.upsert(&docs[..1]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_test_index(&temp_dir).await;

        let mut doc = create_test_document("bad", "manual", "2024-01-01T00:00:00.000000Z", 0);
        doc.embedding = vec![1.0; DIM + 1];
        assert!(index.upsert(&[doc]).await.is_err());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("a'b"), "'a''b'");
    }
}

//! In-memory Vector Index
//!
//! 프로세스 내부 벡터 인덱스입니다. `VECTOR_BACKEND=memory`로 선택하거나
//! 테스트에서 사용합니다. 전체 스캔 코사인 검색입니다.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::vector::{cosine_distance, Document, IndexHit, StoredMetadata, VectorIndex};

#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    documents: RwLock<Vec<Document>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Document>> {
        self.documents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Document>> {
        self.documents.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, documents: &[Document]) -> Result<Vec<String>> {
        let mut stored = self.write();
        let mut ids = Vec::with_capacity(documents.len());

        for doc in documents {
            stored.retain(|d| d.id != doc.id);
            stored.push(doc.clone());
            ids.push(doc.id.to_string());
        }

        Ok(ids)
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        let stored = self.read();

        let mut hits: Vec<IndexHit> = stored
            .iter()
            .map(|doc| IndexHit {
                id: doc.id.to_string(),
                text: doc.text.clone(),
                source: doc.source.clone(),
                timestamp: doc.timestamp.clone(),
                distance: cosine_distance(embedding, &doc.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        Ok(hits)
    }

    async fn get_all(&self) -> Result<Vec<StoredMetadata>> {
        Ok(self
            .read()
            .iter()
            .map(|doc| StoredMetadata {
                id: doc.id.to_string(),
                source: doc.source.clone(),
                timestamp: doc.timestamp.clone(),
            })
            .collect())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        let mut stored = self.write();
        let before = stored.len();
        stored.retain(|doc| !ids.contains(&doc.id.to_string()));
        Ok(before - stored.len())
    }

    async fn delete_all(&self) -> Result<usize> {
        let mut stored = self.write();
        let deleted = stored.len();
        stored.clear();
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read().len())
    }

    fn location(&self) -> String {
        ":memory:".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc(text: &str, embedding: Vec<f32>) -> Document {
        Document {
            id: Uuid::new_v4(),
            text: text.to_string(),
            source: "manual".to_string(),
            timestamp: "2024-01-01T00:00:00.000000Z".to_string(),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_distance() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(&[
                doc("far", vec![0.0, 1.0]),
                doc("near", vec![1.0, 0.1]),
                doc("exact", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "exact");
        assert_eq!(hits[1].text, "near");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let index = MemoryVectorIndex::new();
        let ids = index
            .upsert(&[doc("a", vec![1.0]), doc("b", vec![1.0]), doc("c", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let deleted = index.delete_by_ids(&ids[..2]).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.get_all().await.unwrap()[0].id, ids[2]);
    }

    #[tokio::test]
    async fn test_delete_all() {
        let index = MemoryVectorIndex::new();
        assert_eq!(index.delete_all().await.unwrap(), 0);

        index
            .upsert(&[doc("a", vec![1.0]), doc("b", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(index.delete_all().await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 0);
    }
}

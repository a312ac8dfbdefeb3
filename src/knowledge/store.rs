//! Document Store - 벡터 저장소 어댑터
//!
//! 텍스트 + 메타데이터 + 벡터를 저장하고, 유사도 검색과 기간 기반 정리를 제공합니다.
//! 기본 저장 위치: ~/.ragbot/vectors.lance
//!
//! 모든 쓰기(`add_documents`, `delete_old_documents`, `clear`)는 저장소 단위
//! 쓰기 잠금 하나로 직렬화됩니다. 검색은 잠금을 잡지 않습니다.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::embedding::EmbeddingService;

use super::vector::{iso_timestamp, Document, VectorIndex};

/// 유효 문서 최소 길이 (trim 후 이 값을 초과해야 함)
const MIN_DOCUMENT_CHARS: usize = 10;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.ragbot/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ragbot")
}

// ============================================================================
// Types
// ============================================================================

/// 입력 문서 (문자열 또는 `text` 필드를 가진 레코드)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDocument {
    Text(String),
    Record { text: String },
}

impl RawDocument {
    fn text(&self) -> &str {
        match self {
            RawDocument::Text(text) => text,
            RawDocument::Record { text } => text,
        }
    }
}

impl From<String> for RawDocument {
    fn from(text: String) -> Self {
        RawDocument::Text(text)
    }
}

impl From<&str> for RawDocument {
    fn from(text: &str) -> Self {
        RawDocument::Text(text.to_string())
    }
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_documents: usize,
    pub collection_name: String,
    pub embedding_model: String,
    pub path: String,
}

/// 컬렉션 상세 정보
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionInfo {
    pub total: usize,
    /// 출처별 문서 수
    pub sources: BTreeMap<String, usize>,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

/// 저장소 생성 옵션
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub collection_name: String,
    pub similarity_threshold: f32,
    pub embedding_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            collection_name: "documents".to_string(),
            similarity_threshold: 0.35,
            embedding_batch_size: 10,
        }
    }
}

// ============================================================================
// DocumentStore
// ============================================================================

/// 벡터 저장소 어댑터
///
/// 프로세스 시작 시 한 번 생성되어 `Arc`로 공유됩니다.
pub struct DocumentStore {
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    write_lock: Mutex<()>,
    options: StoreOptions,
}

impl DocumentStore {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
        options: StoreOptions,
    ) -> Self {
        tracing::info!(
            "Document store ready (collection={}, path={})",
            options.collection_name,
            index.location()
        );

        Self {
            index,
            embeddings,
            write_lock: Mutex::new(()),
            options,
        }
    }

    /// 문서 추가
    ///
    /// 빈 입력, 유효 문서 없음, 임베딩 서비스 불가, 임베딩 개수 불일치 시
    /// 오류 없이 `false`를 반환합니다.
    pub async fn add_documents(&self, documents: Vec<RawDocument>, source: &str) -> bool {
        if documents.is_empty() {
            return false;
        }

        let _guard = self.write_lock.lock().await;

        let texts: Vec<String> = documents
            .iter()
            .map(|doc| doc.text().trim())
            .filter(|text| text.chars().count() > MIN_DOCUMENT_CHARS)
            .map(str::to_string)
            .collect();

        if texts.is_empty() {
            tracing::warn!("No valid documents to add");
            return false;
        }

        let embeddings = self
            .embeddings
            .embed_batch(&texts, self.options.embedding_batch_size)
            .await;

        if embeddings.len() != texts.len() {
            tracing::error!(
                "Embedding count mismatch: {} texts, {} embeddings",
                texts.len(),
                embeddings.len()
            );
            return false;
        }

        if embeddings
            .iter()
            .all(|v| EmbeddingService::is_zero_vector(v))
        {
            tracing::error!("Embedding service unavailable, nothing stored");
            return false;
        }

        let timestamp = iso_timestamp(Utc::now());
        let mut skipped = 0;
        let records: Vec<Document> = texts
            .into_iter()
            .zip(embeddings)
            .filter_map(|(text, embedding)| {
                // 0 벡터는 유사도 검색을 오염시키므로 저장하지 않음
                if EmbeddingService::is_zero_vector(&embedding) {
                    skipped += 1;
                    return None;
                }
                Some(Document {
                    id: Uuid::new_v4(),
                    text,
                    source: source.to_string(),
                    timestamp: timestamp.clone(),
                    embedding,
                })
            })
            .collect();

        if skipped > 0 {
            tracing::warn!("Skipped {} documents without embeddings", skipped);
        }

        match self.index.upsert(&records).await {
            Ok(ids) => {
                tracing::info!("Added {} documents (source={})", ids.len(), source);
                true
            }
            Err(e) => {
                tracing::error!("Failed to add documents: {:#}", e);
                false
            }
        }
    }

    /// 유사도 검색 후 컨텍스트 문자열로 포맷
    ///
    /// 유사도 임계값 미만 결과는 제외합니다. 오류 시 빈 문자열을 반환합니다.
    pub async fn search(&self, query: &str, top_k: usize) -> String {
        match self.try_search(query, top_k).await {
            Ok(context) => context,
            Err(e) => {
                tracing::error!("Knowledge base search failed: {:#}", e);
                String::new()
            }
        }
    }

    async fn try_search(&self, query: &str, top_k: usize) -> Result<String> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(String::new());
        }

        if self.index.count().await? == 0 {
            return Ok(String::new());
        }

        let query_embedding = match self.embeddings.embed(&[query.to_string()]).await.pop() {
            Some(v) if !EmbeddingService::is_zero_vector(&v) => v,
            _ => {
                tracing::warn!("Query embedding unavailable, skipping knowledge base search");
                return Ok(String::new());
            }
        };

        let hits = self.index.query(&query_embedding, top_k).await?;

        let sections: Vec<String> = hits
            .into_iter()
            .filter_map(|hit| {
                let similarity = 1.0 - hit.distance;
                if similarity >= self.options.similarity_threshold {
                    Some(format!("[Источник: {}]\n{}", hit.source, hit.text))
                } else {
                    tracing::debug!("Skipped document {} (similarity={:.3})", hit.id, similarity);
                    None
                }
            })
            .collect();

        Ok(sections.join("\n\n"))
    }

    /// N일보다 오래된 문서 삭제
    ///
    /// 저장된 타임스탬프 문자열을 컷오프 문자열과 사전순으로 비교합니다.
    pub async fn delete_old_documents(&self, days: u32) -> usize {
        let _guard = self.write_lock.lock().await;

        let cutoff = iso_timestamp(Utc::now() - chrono::Duration::days(i64::from(days)));

        match self.delete_before(&cutoff).await {
            Ok(0) => {
                tracing::debug!("No documents older than {} days", days);
                0
            }
            Ok(deleted) => {
                tracing::info!("Deleted {} documents older than {} days", deleted, days);
                deleted
            }
            Err(e) => {
                tracing::error!("Failed to delete old documents: {:#}", e);
                0
            }
        }
    }

    async fn delete_before(&self, cutoff: &str) -> Result<usize> {
        let old_ids: Vec<String> = self
            .index
            .get_all()
            .await?
            .into_iter()
            .filter(|meta| meta.timestamp.as_str() < cutoff)
            .map(|meta| meta.id)
            .collect();

        if old_ids.is_empty() {
            return Ok(0);
        }

        self.index.delete_by_ids(&old_ids).await
    }

    /// 모든 문서 삭제
    pub async fn clear(&self) -> bool {
        let _guard = self.write_lock.lock().await;

        match self.index.delete_all().await {
            Ok(deleted) => {
                tracing::info!("Store cleared ({} documents)", deleted);
                true
            }
            Err(e) => {
                tracing::error!("Failed to clear store: {:#}", e);
                false
            }
        }
    }

    /// 저장소 통계
    pub async fn stats(&self) -> StoreStats {
        let total_documents = self.index.count().await.unwrap_or_else(|e| {
            tracing::error!("Failed to count documents: {:#}", e);
            0
        });

        StoreStats {
            total_documents,
            collection_name: self.options.collection_name.clone(),
            embedding_model: self.embeddings.model_name().to_string(),
            path: self.index.location(),
        }
    }

    /// 출처별 개수, 가장 오래된/최신 타임스탬프
    pub async fn collection_info(&self) -> CollectionInfo {
        let all = match self.index.get_all().await {
            Ok(all) => all,
            Err(e) => {
                tracing::error!("Failed to read collection: {:#}", e);
                return CollectionInfo::default();
            }
        };

        let mut info = CollectionInfo {
            total: all.len(),
            ..Default::default()
        };

        for meta in all {
            *info.sources.entry(meta.source).or_insert(0) += 1;

            if meta.timestamp.is_empty() {
                continue;
            }
            if info.oldest.as_ref().map_or(true, |o| meta.timestamp < *o) {
                info.oldest = Some(meta.timestamp.clone());
            }
            if info.newest.as_ref().map_or(true, |n| meta.timestamp > *n) {
                info.newest = Some(meta.timestamp);
            }
        }

        info
    }

    /// 주기적 정리 태스크 시작
    pub fn spawn_periodic_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        days: u32,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 첫 tick은 즉시 반환
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let deleted = store.delete_old_documents(days).await;
                tracing::debug!("Periodic cleanup removed {} documents", deleted);
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::tests::FakeEmbedding;
    use crate::knowledge::memory::MemoryVectorIndex;
    use crate::knowledge::vector::{IndexHit, StoredMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIM: usize = 16;

    fn create_test_store() -> (Arc<MemoryVectorIndex>, DocumentStore) {
        let index = Arc::new(MemoryVectorIndex::new());
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(FakeEmbedding::new(DIM)),
            100,
            DIM,
        ));
        let store = DocumentStore::new(index.clone(), embeddings, StoreOptions::default());
        (index, store)
    }

    fn document_at(text: &str, source: &str, timestamp: String) -> Document {
        Document {
            id: Uuid::new_v4(),
            text: text.to_string(),
            source: source.to_string(),
            timestamp,
            embedding: FakeEmbedding::vector_for(text, DIM),
        }
    }

    /// 고정 거리를 반환하는 인덱스 (임계값 경계 테스트용)
    struct FixedDistanceIndex {
        hits: Vec<(f32, &'static str)>,
    }

    #[async_trait]
    impl VectorIndex for FixedDistanceIndex {
        async fn upsert(&self, documents: &[Document]) -> Result<Vec<String>> {
            Ok(documents.iter().map(|d| d.id.to_string()).collect())
        }

        async fn query(&self, _embedding: &[f32], k: usize) -> Result<Vec<IndexHit>> {
            Ok(self
                .hits
                .iter()
                .take(k)
                .enumerate()
                .map(|(i, (distance, text))| IndexHit {
                    id: i.to_string(),
                    text: text.to_string(),
                    source: "manual".to_string(),
                    timestamp: String::new(),
                    distance: *distance,
                })
                .collect())
        }

        async fn get_all(&self) -> Result<Vec<StoredMetadata>> {
            Ok(vec![])
        }

        async fn delete_by_ids(&self, _ids: &[String]) -> Result<usize> {
            Ok(0)
        }

        async fn delete_all(&self) -> Result<usize> {
            Ok(0)
        }

        async fn count(&self) -> Result<usize> {
            Ok(self.hits.len())
        }

        fn location(&self) -> String {
            "fixed".to_string()
        }
    }

    #[tokio::test]
    async fn test_add_documents_filters_short_entries() {
        let (index, store) = create_test_store();

        let added = store
            .add_documents(
                vec![
                    "   short    ".into(),
                    RawDocument::Record {
                        text: "  Rust ownership rules explained in depth  ".to_string(),
                    },
                    "exactly10!".into(),
                    "Tokio runtime drives async tasks".into(),
                ],
                "manual",
            )
            .await;

        assert!(added);
        assert_eq!(index.count().await.unwrap(), 2);

        let info = store.collection_info().await;
        assert_eq!(info.sources.get("manual"), Some(&2));
    }

    #[tokio::test]
    async fn test_add_documents_rejects_empty_and_invalid() {
        let (index, store) = create_test_store();

        assert!(!store.add_documents(vec![], "manual").await);
        assert!(!store.add_documents(vec!["tiny".into(), "   ".into()], "manual").await);
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_documents_embedding_unavailable() {
        let index = Arc::new(MemoryVectorIndex::new());
        let text = "this text cannot be embedded";
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(FakeEmbedding::failing_on(DIM, text)),
            100,
            DIM,
        ));
        let store = DocumentStore::new(index.clone(), embeddings, StoreOptions::default());

        assert!(!store.add_documents(vec![text.into()], "manual").await);
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[test]
    fn test_raw_document_deserialize() {
        let docs: Vec<RawDocument> =
            serde_json::from_str(r#"["plain text", {"text": "record text"}]"#).unwrap();
        assert_eq!(docs[0].text(), "plain text");
        assert_eq!(docs[1].text(), "record text");
    }

    #[tokio::test]
    async fn test_search_empty_query_and_empty_store() {
        let (_index, store) = create_test_store();
        assert_eq!(store.search("", 5).await, "");
        assert_eq!(store.search("   ", 5).await, "");
        assert_eq!(store.search("anything at all", 5).await, "");
    }

    #[tokio::test]
    async fn test_search_formats_results() {
        let (_index, store) = create_test_store();
        store
            .add_documents(vec!["Tokio runtime drives async tasks".into()], "manual")
            .await;

        let context = store.search("Tokio runtime drives async tasks", 5).await;
        assert_eq!(context, "[Источник: manual]\nTokio runtime drives async tasks");
    }

    #[tokio::test]
    async fn test_similarity_threshold_boundary() {
        let index = Arc::new(FixedDistanceIndex {
            hits: vec![
                (0.10, "close match"),
                (0.65, "boundary match"),
                (0.650001, "just below threshold"),
                (0.90, "unrelated"),
            ],
        });
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(FakeEmbedding::new(DIM)),
            100,
            DIM,
        ));
        let store = DocumentStore::new(index, embeddings, StoreOptions::default());

        let context = store.search("query", 10).await;
        assert_eq!(
            context,
            "[Источник: manual]\nclose match\n\n[Источник: manual]\nboundary match"
        );
    }

    #[tokio::test]
    async fn test_delete_old_documents() {
        let (index, store) = create_test_store();
        let now = Utc::now();

        index
            .upsert(&[
                document_at("ninety days old", "web_auto", iso_timestamp(now - chrono::Duration::days(90))),
                document_at("sixty-one days old", "manual", iso_timestamp(now - chrono::Duration::days(61))),
                document_at("fifty-nine days old", "manual", iso_timestamp(now - chrono::Duration::days(59))),
                document_at("fresh", "manual", iso_timestamp(now)),
            ])
            .await
            .unwrap();

        let deleted = store.delete_old_documents(60).await;
        assert_eq!(deleted, 2);
        assert_eq!(index.count().await.unwrap(), 2);

        assert_eq!(store.delete_old_documents(60).await, 0);
    }

    #[tokio::test]
    async fn test_delete_old_documents_empty_store() {
        let (_index, store) = create_test_store();
        assert_eq!(store.delete_old_documents(60).await, 0);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let (_index, store) = create_test_store();
        store
            .add_documents(
                vec![
                    "First document about vectors".into(),
                    "Second document about caches".into(),
                ],
                "manual",
            )
            .await;

        let stats = store.stats().await;
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.collection_name, "documents");
        assert_eq!(stats.embedding_model, "fake-embed");
        assert_eq!(stats.path, ":memory:");

        assert!(store.clear().await);
        assert_eq!(store.stats().await.total_documents, 0);
    }

    #[tokio::test]
    async fn test_collection_info() {
        let (index, store) = create_test_store();

        let empty = store.collection_info().await;
        assert_eq!(empty.total, 0);
        assert!(empty.oldest.is_none());

        index
            .upsert(&[
                document_at("a web snippet", "web_auto", "2024-03-01T00:00:00.000000Z".to_string()),
                document_at("a manual note", "manual", "2024-01-01T00:00:00.000000Z".to_string()),
                document_at("another snippet", "web_auto", "2024-05-01T00:00:00.000000Z".to_string()),
            ])
            .await
            .unwrap();

        let info = store.collection_info().await;
        assert_eq!(info.total, 3);
        assert_eq!(info.sources.get("web_auto"), Some(&2));
        assert_eq!(info.sources.get("manual"), Some(&1));
        assert_eq!(info.oldest.as_deref(), Some("2024-01-01T00:00:00.000000Z"));
        assert_eq!(info.newest.as_deref(), Some("2024-05-01T00:00:00.000000Z"));
    }

    /// 쓰기 연산의 동시 실행 수를 기록하는 인덱스
    #[derive(Default)]
    struct TrackingIndex {
        inner: MemoryVectorIndex,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        writes: AtomicUsize,
    }

    impl TrackingIndex {
        async fn track<T>(&self, op: impl std::future::Future<Output = Result<T>>) -> Result<T> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);

            // 다른 쓰기가 끼어들 틈을 만듦
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = op.await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[async_trait]
    impl VectorIndex for TrackingIndex {
        async fn upsert(&self, documents: &[Document]) -> Result<Vec<String>> {
            self.track(self.inner.upsert(documents)).await
        }

        async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>> {
            self.inner.query(embedding, k).await
        }

        async fn get_all(&self) -> Result<Vec<StoredMetadata>> {
            self.inner.get_all().await
        }

        async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
            self.track(self.inner.delete_by_ids(ids)).await
        }

        async fn delete_all(&self) -> Result<usize> {
            self.track(self.inner.delete_all()).await
        }

        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }

        fn location(&self) -> String {
            "tracking".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_interleave() {
        let index = Arc::new(TrackingIndex::default());
        let old = iso_timestamp(Utc::now() - chrono::Duration::days(90));
        index
            .inner
            .upsert(&[
                document_at("an old web snippet", "web_auto", old.clone()),
                document_at("an old manual note", "manual", old),
            ])
            .await
            .unwrap();

        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(FakeEmbedding::new(DIM)),
            100,
            DIM,
        ));
        let store = Arc::new(DocumentStore::new(
            index.clone(),
            embeddings,
            StoreOptions::default(),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let doc = format!("concurrent document number {}", i);
                assert!(store.add_documents(vec![doc.into()], "manual").await);
            });
        }
        for _ in 0..2 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                store.delete_old_documents(60).await;
            });
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                assert!(store.clear().await);
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        // upsert 4회 + delete_all 2회 이상
        assert!(index.writes.load(Ordering::SeqCst) >= 6);
        assert_eq!(index.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(index.in_flight.load(Ordering::SeqCst), 0);
    }
}

//! 임베딩 모듈 - Ollama API를 통한 텍스트 벡터화 + 캐시
//!
//! 텍스트를 벡터로 변환하는 백엔드와, 최근 결과를 기억하는
//! `EmbeddingService`(캐시 계층)를 제공합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let backend = OllamaEmbedding::new(&settings, gate)?;
//! let service = EmbeddingService::new(Arc::new(backend), 1000, 768);
//! let vectors = service.embed(&["Hello, world!".to_string()]).await;
//! ```
//!
//! 백엔드 오류는 이 모듈 밖으로 나가지 않습니다. 실패한 텍스트는
//! 고정 길이 0 벡터로 대체됩니다.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::Settings;
use crate::http::{build_client, HttpGate};

// ============================================================================
// EmbeddingBackend Trait
// ============================================================================

/// 임베딩 백엔드 트레이트
///
/// 한 번의 호출에 텍스트 하나를 벡터로 변환합니다 (네트워크 호출).
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 백엔드(모델) 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// Ollama `/api/embeddings` 백엔드
#[derive(Debug)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    gate: HttpGate,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OllamaEmbedding {
    pub fn new(settings: &Settings, gate: HttpGate) -> Result<Self> {
        let endpoint = settings
            .ollama_host
            .join("api/embeddings")
            .context("Failed to build embeddings endpoint")?;

        Ok(Self {
            client: build_client(settings.embedding_timeout)?,
            endpoint,
            model: settings.embedding_model.clone(),
            gate,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self.gate.acquire().await?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbedRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .context("Failed to send embedding request")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Embeddings API error ({})", status);
        }

        let body: EmbedResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if body.embedding.is_empty() {
            anyhow::bail!("Embeddings API returned an empty vector");
        }

        Ok(body.embedding)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Embedding Cache
// ============================================================================

type CacheKey = [u8; 32];

/// 텍스트 내용 해시 (프로세스 간 안정적)
fn content_hash(text: &str) -> CacheKey {
    let digest = Sha256::digest(text.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// 크기 제한 캐시
///
/// 삽입 순서(FIFO)로 제거합니다. 조회 시 순서를 갱신하지 않으므로 LRU가 아닙니다.
#[derive(Debug)]
struct EmbeddingCache {
    entries: HashMap<CacheKey, Vec<f32>>,
    order: VecDeque<CacheKey>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, vector: Vec<f32>) {
        // 기존 키 덮어쓰기는 순서를 바꾸지 않음
        if self.entries.insert(key, vector).is_none() {
            self.order.push_back(key);
        }

        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// EmbeddingService
// ============================================================================

/// 캐시를 갖춘 임베딩 서비스
///
/// 여러 태스크에서 동시에 사용해도 안전합니다. 캐시 잠금은 await 경계를
/// 넘어 유지되지 않습니다.
pub struct EmbeddingService {
    backend: Arc<dyn EmbeddingBackend>,
    cache: Mutex<EmbeddingCache>,
    dimension: usize,
}

impl EmbeddingService {
    /// # Arguments
    /// * `backend` - 실제 임베딩 백엔드
    /// * `cache_size` - 캐시 최대 항목 수
    /// * `dimension` - 실패 시 대체할 0 벡터 길이
    pub fn new(backend: Arc<dyn EmbeddingBackend>, cache_size: usize, dimension: usize) -> Self {
        tracing::info!(
            "Embedding service ready (model={}, cache_size={}, dimension={})",
            backend.name(),
            cache_size,
            dimension
        );

        Self {
            backend,
            cache: Mutex::new(EmbeddingCache::new(cache_size)),
            dimension,
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.name()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// 0 벡터 여부 (백엔드 실패 대체값)
    pub fn is_zero_vector(vector: &[f32]) -> bool {
        vector.iter().all(|v| *v == 0.0)
    }

    /// 텍스트 목록 임베딩
    ///
    /// 결과의 i번째 벡터는 항상 `texts[i]`에 대응합니다.
    /// 캐시에 없는 텍스트만 백엔드를 호출하며, 호출은 동시에 진행됩니다.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let keys: Vec<CacheKey> = texts.iter().map(|t| content_hash(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<(CacheKey, &str)> = Vec::new();

        {
            let cache = self.lock_cache();
            for (i, key) in keys.iter().enumerate() {
                match cache.get(key) {
                    Some(vector) => results[i] = Some(vector),
                    None => {
                        if !misses.iter().any(|(k, _)| k == key) {
                            misses.push((*key, texts[i].as_str()));
                        }
                    }
                }
            }
        }

        if !misses.is_empty() {
            tracing::debug!(
                "Embedding {} uncached texts ({} cached)",
                misses.len(),
                texts.len() - misses.len()
            );

            let fetched = futures::future::join_all(
                misses
                    .iter()
                    .map(|(key, text)| async move { (*key, self.embed_one(text).await) }),
            )
            .await;

            let mut computed: HashMap<CacheKey, Vec<f32>> = HashMap::with_capacity(fetched.len());
            {
                let mut cache = self.lock_cache();
                for (key, outcome) in fetched {
                    let vector = match outcome {
                        Some(vector) => {
                            cache.insert(key, vector.clone());
                            vector
                        }
                        None => vec![0.0; self.dimension],
                    };
                    computed.insert(key, vector);
                }
            }

            for (i, key) in keys.iter().enumerate() {
                if results[i].is_none() {
                    results[i] = computed.get(key).cloned();
                }
            }
        }

        results
            .into_iter()
            .map(|v| v.unwrap_or_else(|| vec![0.0; self.dimension]))
            .collect()
    }

    /// 배치 단위 임베딩 (순서 유지하며 결과 연결)
    pub async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Vec<Vec<f32>> {
        let mut all = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(batch_size.max(1)).enumerate() {
            tracing::debug!("Embedding batch {} ({} texts)", i + 1, batch.len());
            all.extend(self.embed(batch).await);
        }
        all
    }

    /// 캐시 비우기
    pub fn clear_cache(&self) {
        self.lock_cache().clear();
        tracing::info!("Embedding cache cleared");
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    /// 단일 텍스트 백엔드 호출, 실패 시 `None`
    async fn embed_one(&self, text: &str) -> Option<Vec<f32>> {
        match self.backend.embed(text).await {
            Ok(vector) if !vector.is_empty() => Some(vector),
            Ok(_) => {
                tracing::warn!("Embedding backend returned an empty vector, using zero vector");
                None
            }
            Err(e) => {
                tracing::error!("Embedding failed, using zero vector: {:#}", e);
                None
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, EmbeddingCache> {
        // 캐시 내용은 항상 일관된 상태로만 갱신되므로 poison 상태여도 계속 사용
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Vector Index - 벡터 인덱스 트레이트 및 유틸리티
//!
//! 벡터 DB 엔진 자체는 외부 구성요소로 취급하고, 여기서는
//! upsert / query / get_all / delete / count 기능만 정의합니다.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 타임스탬프 저장 형식 (UTC, 고정 폭)
///
/// 문자열 사전순 비교가 시간순과 일치해야 하므로 반드시 이 형식만 사용합니다.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// ISO-8601 타임스탬프 문자열
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

// ============================================================================
// Types
// ============================================================================

/// 저장 문서 (삽입 후 변경되지 않음)
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    /// 정규화된 본문 (trim 후 10자 초과)
    pub text: String,
    /// 출처 태그 ("manual", "web_auto", ...)
    pub source: String,
    /// `TIMESTAMP_FORMAT` 형식
    pub timestamp: String,
    pub embedding: Vec<f32>,
}

/// 유사도 검색 결과 한 건
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub source: String,
    pub timestamp: String,
    /// 코사인 거리 (유사도 = 1 - 거리)
    pub distance: f32,
}

/// 저장된 메타데이터 (본문/벡터 제외)
#[derive(Debug, Clone)]
pub struct StoredMetadata {
    pub id: String,
    pub source: String,
    pub timestamp: String,
}

// ============================================================================
// VectorIndex Trait
// ============================================================================

/// VectorIndex 트레이트 (async)
///
/// 벡터 DB 엔진의 공통 인터페이스입니다.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 문서 일괄 삽입, 저장된 ID 반환
    async fn upsert(&self, documents: &[Document]) -> Result<Vec<String>>;

    /// 코사인 거리 오름차순 k개 검색
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>>;

    /// 모든 문서의 메타데이터
    async fn get_all(&self) -> Result<Vec<StoredMetadata>>;

    /// ID 목록으로 삭제, 삭제된 개수 반환
    async fn delete_by_ids(&self, ids: &[String]) -> Result<usize>;

    /// 전체 삭제, 삭제된 개수 반환
    async fn delete_all(&self) -> Result<usize>;

    /// 문서 개수
    async fn count(&self) -> Result<usize>;

    /// 저장 위치 설명 (통계 표시용)
    fn location(&self) -> String;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 0 벡터가 포함되면 0.0입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// 코사인 거리 (1 - 유사도)
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

// ============================================================================
// Tests
// ============================================================================

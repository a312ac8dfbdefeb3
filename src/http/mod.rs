//! 외부 HTTP 호출 공통 모듈
//!
//! 임베딩/생성/웹 검색 클라이언트가 공유하는 동시성 게이트와
//! 타임아웃이 설정된 reqwest 클라이언트 생성 함수를 제공합니다.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 전역 외부 호출 동시성 제한
///
/// 모든 백엔드 요청은 전송 전에 permit을 얻고, 응답을 다 읽을 때까지 보유합니다.
#[derive(Debug, Clone)]
pub struct HttpGate {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl HttpGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// permit 획득 (사용 가능할 때까지 대기)
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .context("Outbound request gate closed")
    }

    /// 현재 사용 가능한 permit 수
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// 타임아웃이 설정된 HTTP 클라이언트 생성
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .context("Failed to create HTTP client")
}

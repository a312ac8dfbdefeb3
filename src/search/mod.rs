//! 웹 검색 모듈 - 검색 엔진 HTML 결과 파싱
//!
//! DuckDuckGo Lite → Bing → Google 순으로 시도하고, 처음으로 결과를 돌려준
//! 엔진의 결과를 사용합니다. 모든 오류는 빈 결과로 처리됩니다.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, DNT, USER_AGENT};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use url::Url;

use crate::config::Settings;
use crate::http::{build_client, HttpGate};

/// 스니펫 최소 길이 (이 값을 초과해야 유효)
const MIN_SNIPPET_CHARS: usize = 20;

const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
];

// ============================================================================
// Types
// ============================================================================

/// 검색 결과 한 건
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl SearchResult {
    /// 제목/URL이 있고 스니펫이 20자를 초과하는지
    pub fn is_valid(&self) -> bool {
        !self.title.is_empty()
            && !self.url.is_empty()
            && self.snippet.chars().count() > MIN_SNIPPET_CHARS
    }
}

/// 검색 엔진 (시도 순서대로)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEngine {
    DuckDuckGoLite,
    Bing,
    Google,
}

impl SearchEngine {
    pub const FALLBACK_ORDER: [SearchEngine; 3] = [
        SearchEngine::DuckDuckGoLite,
        SearchEngine::Bing,
        SearchEngine::Google,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SearchEngine::DuckDuckGoLite => "DuckDuckGo",
            SearchEngine::Bing => "Bing",
            SearchEngine::Google => "Google",
        }
    }

    /// HTML에서 결과 추출 (최대 `limit`개, 유효성 필터 적용)
    pub fn parse(&self, html: &str, limit: usize) -> Vec<SearchResult> {
        let document = Html::parse_document(html);
        let results = match self {
            SearchEngine::DuckDuckGoLite => parse_ddg_lite(&document),
            SearchEngine::Bing => parse_bing(&document, limit),
            SearchEngine::Google => parse_google(&document, limit),
        };

        results
            .into_iter()
            .filter(SearchResult::is_valid)
            .take(limit)
            .collect()
    }
}

/// 엔진별 요청 주소
#[derive(Debug, Clone)]
pub struct SearchEndpoints {
    pub ddg_lite: String,
    pub bing: String,
    pub google: String,
}

impl Default for SearchEndpoints {
    fn default() -> Self {
        Self {
            ddg_lite: "https://lite.duckduckgo.com/lite/".to_string(),
            bing: "https://www.bing.com/search".to_string(),
            google: "https://www.google.com/search".to_string(),
        }
    }
}

// ============================================================================
// WebSearch Trait
// ============================================================================

/// 웹 검색 트레이트
///
/// 실패는 빈 목록으로 표현되며, 오류를 반환하지 않습니다.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, num_results: usize) -> Vec<SearchResult>;
}

// ============================================================================
// WebSearchClient
// ============================================================================

/// 다중 엔진 웹 검색 클라이언트
pub struct WebSearchClient {
    client: reqwest::Client,
    gate: HttpGate,
    endpoints: SearchEndpoints,
    /// 엔진별 파싱 상한
    max_results: usize,
}

impl WebSearchClient {
    pub fn new(settings: &Settings, gate: HttpGate) -> Result<Self> {
        Self::with_endpoints(settings, gate, SearchEndpoints::default())
    }

    pub fn with_endpoints(
        settings: &Settings,
        gate: HttpGate,
        endpoints: SearchEndpoints,
    ) -> Result<Self> {
        tracing::info!(
            "Web search client ready (timeout={:?}, max_results={})",
            settings.web_search_timeout,
            settings.web_search_results
        );

        Ok(Self {
            client: build_client(settings.web_search_timeout)?,
            gate,
            endpoints,
            max_results: settings.web_search_results,
        })
    }

    /// 단일 엔진 시도: HTML 응답 본문, 200이 아니면 `None`
    async fn fetch(&self, engine: SearchEngine, query: &str) -> Result<Option<String>> {
        let _permit = self.gate.acquire().await?;

        let request = match engine {
            SearchEngine::DuckDuckGoLite => self
                .client
                .post(&self.endpoints.ddg_lite)
                .form(&[("q", query)]),
            SearchEngine::Bing => self.client.get(query_url(&self.endpoints.bing, query)?),
            SearchEngine::Google => self.client.get(query_url(&self.endpoints.google, query)?),
        };

        let response = request
            .headers(request_headers())
            .send()
            .await
            .with_context(|| format!("{} request failed", engine.name()))?;

        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!("{} returned status {}", engine.name(), response.status());
            return Ok(None);
        }

        let html = response
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", engine.name()))?;

        Ok(Some(html))
    }

    async fn try_engine(&self, engine: SearchEngine, query: &str) -> Vec<SearchResult> {
        match self.fetch(engine, query).await {
            Ok(Some(html)) => engine.parse(&html, self.max_results),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::debug!("{} search failed: {:#}", engine.name(), e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl WebSearch for WebSearchClient {
    async fn search(&self, query: &str, num_results: usize) -> Vec<SearchResult> {
        let query = query.trim();
        if query.is_empty() || num_results == 0 {
            return Vec::new();
        }

        tracing::info!("Web search: '{}'", query.chars().take(50).collect::<String>());

        for engine in SearchEngine::FALLBACK_ORDER {
            let mut results = self.try_engine(engine, query).await;
            if !results.is_empty() {
                tracing::info!("{}: found {} results", engine.name(), results.len());
                results.truncate(num_results);
                return results;
            }
            tracing::debug!("{} returned nothing, trying next engine", engine.name());
        }

        tracing::warn!("Web search found no results");
        Vec::new()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn query_url(base: &str, query: &str) -> Result<Url> {
    Url::parse_with_params(base, &[("q", query)])
        .with_context(|| format!("Invalid search URL: {}", base))
}

/// 요청 헤더 (User-Agent는 매번 무작위)
fn request_headers() -> HeaderMap {
    let agent = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(agent));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ru-RU,ru;q=0.9"));
    headers.insert(DNT, HeaderValue::from_static("1"));
    headers
}

/// 요소 텍스트 (공백 정리)
fn element_text(element: &ElementRef) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// DuckDuckGo Lite: 첫 행(헤더) 이후 `tr`마다 링크 셀 + 스니펫 셀
fn parse_ddg_lite(document: &Html) -> Vec<SearchResult> {
    let (Some(row_sel), Some(cell_sel), Some(link_sel)) =
        (selector("tr"), selector("td"), selector("a"))
    else {
        return Vec::new();
    };

    document
        .select(&row_sel)
        .skip(1)
        .filter_map(|row| {
            let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
            if cells.len() < 2 {
                return None;
            }
            let link = cells[0].select(&link_sel).next()?;
            Some(SearchResult {
                title: element_text(&link),
                url: link.value().attr("href").unwrap_or_default().to_string(),
                snippet: element_text(&cells[1]),
            })
        })
        .collect()
}

/// Bing: `li.b_algo` → `h2 a` + `p`
fn parse_bing(document: &Html, limit: usize) -> Vec<SearchResult> {
    let (Some(item_sel), Some(link_sel), Some(snippet_sel)) =
        (selector("li.b_algo"), selector("h2 a"), selector("p"))
    else {
        return Vec::new();
    };

    document
        .select(&item_sel)
        .take(limit)
        .filter_map(|item| {
            let link = item.select(&link_sel).next()?;
            let snippet = item.select(&snippet_sel).next()?;
            Some(SearchResult {
                title: element_text(&link),
                url: link.value().attr("href").unwrap_or_default().to_string(),
                snippet: element_text(&snippet),
            })
        })
        .collect()
}

/// Google: `div.g` → 첫 `a` + `h3` + `div.s, span.st`
fn parse_google(document: &Html, limit: usize) -> Vec<SearchResult> {
    let (Some(item_sel), Some(link_sel), Some(title_sel), Some(snippet_sel)) = (
        selector("div.g"),
        selector("a"),
        selector("h3"),
        selector("div.s, span.st"),
    ) else {
        return Vec::new();
    };

    document
        .select(&item_sel)
        .take(limit)
        .filter_map(|item| {
            let link = item.select(&link_sel).next()?;
            let title = item.select(&title_sel).next()?;
            let snippet = item
                .select(&snippet_sel)
                .next()
                .map(|s| element_text(&s))
                .unwrap_or_default();
            Some(SearchResult {
                title: element_text(&title),
                url: link.value().attr("href").unwrap_or_default().to_string(),
                snippet,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

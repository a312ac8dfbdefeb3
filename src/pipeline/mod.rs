//! RAG 파이프라인 - 검색 + 컨텍스트 구성 + 답변 생성
//!
//! 지식 베이스 검색과 웹 검색을 동시에 실행합니다 (concurrent fan-out).
//! 한쪽 분기의 실패/패닉은 빈 결과로 처리되며 다른 분기에 영향을 주지 않습니다.
//! 웹 결과는 응답을 기다리게 하지 않는 백그라운드 태스크로 지식 베이스에 저장됩니다.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;

use crate::config::{Mode, ModeTable, Settings};
use crate::knowledge::{DocumentStore, RawDocument};
use crate::llm::AnswerGenerator;
use crate::search::{SearchResult, WebSearch};

pub const EMPTY_QUERY_MESSAGE: &str = "Пустой запрос. Напиши что-нибудь!";
pub const NOTHING_FOUND_MESSAGE: &str = "❌ Я не нашел информации. Попробуй переформулировать.";
pub const GENERATION_FAILED_MESSAGE: &str =
    "❌ Не удалось получить ответ от модели. Попробуй позже.";

const WEB_SECTION_LABEL: &str = "=== FROM INTERNET ===";
const DB_SECTION_LABEL: &str = "=== FROM KNOWLEDGE BASE ===";

/// 지식 베이스 컨텍스트 최소 길이 (초과해야 사용)
const MIN_DB_CONTEXT_CHARS: usize = 50;
/// 저장할 웹 블록 최소 길이 (초과해야 저장)
const MIN_SAVED_BLOCK_CHARS: usize = 50;
/// 자동 저장 문서의 출처 태그
pub const WEB_AUTO_SOURCE: &str = "web_auto";

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub db_search_top_k: usize,
    pub max_context_chars: usize,
    /// 웹 결과 자동 저장 여부
    pub auto_add_sources: bool,
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            db_search_top_k: settings.db_search_top_k,
            max_context_chars: settings.max_context_chars,
            auto_add_sources: settings.auto_add_sources,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            db_search_top_k: 5,
            max_context_chars: 12_000,
            auto_add_sources: true,
        }
    }
}

// ============================================================================
// BackgroundTasks
// ============================================================================

/// 분리 실행되는 백그라운드 태스크 집합
///
/// 요청 경로는 결과를 기다리지 않습니다. 종료 시 `drain`으로 남은 태스크를
/// 기다리고, 시간 초과 시 분리(detach)합니다. Drop 시에도 중단하지 않고 분리합니다.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 태스크 시작 (완료된 태스크는 이때 정리)
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        while let Some(finished) = tasks.try_join_next() {
            log_join_result(finished);
        }
        tasks.spawn(task);
    }

    /// 실행 중인 태스크 수
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// 남은 태스크 대기, 모두 끝나면 `true`
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut tasks = std::mem::take(&mut *self.lock());
        if tasks.is_empty() {
            return true;
        }

        tracing::info!("Waiting for {} background tasks", tasks.len());

        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join_result(result);
            }
        })
        .await
        .is_ok();

        if !finished {
            tracing::warn!(
                "{} background tasks still running after {:?}, detaching",
                tasks.len(),
                timeout
            );
            tasks.detach_all();
        }

        finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        tasks.detach_all();
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Background task failed: {}", e);
    }
}

// ============================================================================
// RagPipeline
// ============================================================================

/// RAG 오케스트레이터
///
/// 프로세스 시작 시 한 번 생성되며, 요청마다 `process`가 독립적으로 실행됩니다.
pub struct RagPipeline {
    store: Arc<DocumentStore>,
    web: Arc<dyn WebSearch>,
    generator: Arc<AnswerGenerator>,
    modes: ModeTable,
    options: PipelineOptions,
    background: BackgroundTasks,
}

impl RagPipeline {
    pub fn new(
        store: Arc<DocumentStore>,
        web: Arc<dyn WebSearch>,
        generator: Arc<AnswerGenerator>,
        modes: ModeTable,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            web,
            generator,
            modes,
            options,
            background: BackgroundTasks::new(),
        }
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// 질의 처리
    ///
    /// 항상 사용자에게 보여줄 문자열을 반환합니다.
    pub async fn process(&self, query: &str, mode: Mode) -> String {
        let query = query.trim();
        if query.is_empty() {
            return EMPTY_QUERY_MESSAGE.to_string();
        }

        let cfg = self.modes.get(mode);
        tracing::info!(
            "[{}] Processing: {}",
            mode.as_str().to_uppercase(),
            query.chars().take(50).collect::<String>()
        );

        // 1. 병렬 검색
        let web_branch = async {
            if cfg.web_search {
                self.search_web(query, cfg.web_search_results).await
            } else {
                String::new()
            }
        };
        let db_branch = async {
            if cfg.db_search {
                self.store.search(query, self.options.db_search_top_k).await
            } else {
                String::new()
            }
        };

        let (web_context, db_context) =
            tokio::join!(isolated("web", web_branch), isolated("db", db_branch));

        // 2. 컨텍스트 구성
        let context = self.build_context(&web_context, &db_context);
        if context.is_empty() {
            tracing::warn!("No context found from web or knowledge base");
            return NOTHING_FOUND_MESSAGE.to_string();
        }

        // 3. 백그라운드 저장
        if !web_context.is_empty() && self.options.auto_add_sources {
            self.spawn_save(web_context);
        }

        // 4. 답변 생성
        let prompt = build_prompt(mode, query, &context);
        let answer = self.generator.generate(&prompt, &context, mode).await;
        if answer.is_empty() {
            return GENERATION_FAILED_MESSAGE.to_string();
        }

        answer
    }

    async fn search_web(&self, query: &str, num_results: usize) -> String {
        let results = self.web.search(query, num_results).await;
        format_web_results(&results)
    }

    fn build_context(&self, web_context: &str, db_context: &str) -> String {
        let mut context = String::new();

        if !web_context.is_empty() {
            context.push_str(WEB_SECTION_LABEL);
            context.push_str("\n\n");
            context.push_str(web_context);
            context.push_str("\n\n");
        }

        if db_context.chars().count() > MIN_DB_CONTEXT_CHARS {
            context.push_str(DB_SECTION_LABEL);
            context.push_str("\n\n");
            context.push_str(db_context);
        }

        truncate_chars(context.trim_end(), self.options.max_context_chars)
    }

    /// 웹 컨텍스트를 블록 단위로 지식 베이스에 저장 (응답과 분리)
    fn spawn_save(&self, web_context: String) {
        let store = Arc::clone(&self.store);

        self.background.spawn(async move {
            let documents: Vec<RawDocument> = web_context
                .split("\n\n")
                .map(str::trim)
                .filter(|block| block.chars().count() > MIN_SAVED_BLOCK_CHARS)
                .map(RawDocument::from)
                .collect();

            if documents.is_empty() {
                return;
            }

            let count = documents.len();
            if store.add_documents(documents, WEB_AUTO_SOURCE).await {
                tracing::info!("Saved {} web snippets to knowledge base", count);
            } else {
                tracing::warn!("Background save stored no web snippets");
            }
        });
    }
}

/// 분기 실행 (패닉은 빈 문자열로 대체)
async fn isolated<F>(branch: &str, future: F) -> String
where
    F: Future<Output = String>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(context) => context,
        Err(_) => {
            tracing::error!("{} search branch panicked, continuing without it", branch);
            String::new()
        }
    }
}

/// 웹 결과 → 번호 매긴 컨텍스트 블록
pub fn format_web_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .filter_map(|(i, result)| {
            let title = result.title.trim();
            let snippet = result.snippet.trim();
            let url = result.url.trim();

            let mut lines = Vec::new();
            if !title.is_empty() && !snippet.is_empty() {
                lines.push(format!("{}. {}\n{}", i + 1, title, snippet));
            }
            if !url.is_empty() {
                lines.push(format!("Источник: {}", url));
            }

            if lines.is_empty() {
                None
            } else {
                Some(lines.join("\n"))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 모드별 프롬프트
pub fn build_prompt(mode: Mode, query: &str, context: &str) -> String {
    let instructions = match mode {
        Mode::Short => "Дай краткий ответ (2-3 предложения).\nЯзык: РУССКИЙ.",
        Mode::Default => {
            "Дай полный ответ на вопрос.\n\
             Используй информацию ниже. Структурируй ответ.\n\
             Объем: 500-1000 слов.\n\
             Язык: РУССКИЙ."
        }
        Mode::Detailed => {
            "Дай ОЧЕНЬ подробный ответ.\n\
             Объясни детали, приведи примеры.\n\
             Объем: 1500+ слов.\n\
             Язык: РУССКИЙ."
        }
    };

    format!(
        "{}\n\nИнформация:\n{}\n\nВопрос: {}\n\nОтвет:",
        instructions, context, query
    )
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

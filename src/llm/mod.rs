//! LLM 모듈 - 답변 생성 + 잘림 감지/이어쓰기
//!
//! `GenerationBackend`가 단일 생성 호출을 담당하고, `AnswerGenerator`가
//! 모드별 파라미터 결정, 출력 정리, 이어쓰기 상태 머신을 담당합니다.
//!
//! 이어쓰기 상태 머신:
//! ```text
//! Generated ──(short 모드)──────────────────────────▶ Done
//!     │
//!     ▼
//! CheckIncomplete ──(완결 또는 재시도 한도)────────▶ Done
//!     │ ▲
//!     ▼ │ (이어쓰기 채택)
//! Continuing ──(빈 응답 / 짧음 / 중복)─────────────▶ Done
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{Mode, ModeTable, Settings};
use crate::http::{build_client, HttpGate};

/// short 모드 최대 토큰 상한
pub const SHORT_MODE_TOKEN_CAP: u32 = 120;
/// 예상 토큰 비율이 이 값을 넘으면 잘린 것으로 판단
pub const INCOMPLETE_THRESHOLD: f64 = 0.85;
/// 토큰당 평균 문자 수 (추정치)
pub const CHARS_PER_TOKEN: f64 = 3.5;
/// 최대 이어쓰기 횟수
pub const MAX_CONTINUATION_RETRIES: u32 = 2;
/// 이어쓰기 최소 길이 (미만이면 버림)
pub const MIN_CONTINUATION_CHARS: usize = 50;

/// 완결된 응답으로 보는 끝 문자열
const TERMINAL_MARKERS: [&str; 10] = [".", "!", "?", "```", "`", "\"", "»", ")", "]", "}"];
const TAIL_CHARS: usize = 40;

const SYSTEM_PROMPT: &str = "Ты полезный помощник AI на русском языке.

ГЛАВНОЕ ПРАВИЛО: Всегда отвечай ТОЛЬКО на РУССКОМ языке. Никаких исключений.

Если в вопросе английский текст - переводи его и отвечай по-русски.
Если нужны примеры кода на английском - оставляй код как есть, но описание пиши на русском.

Инструкции:
1. Отвечай четко и по существу
2. Используй предоставленный контекст если дан
3. Структурируй ответ (заголовки, списки при необходимости)
4. Если приводишь код или команды - оборачивай в ```python``` или ```bash```
5. Будь вежлив и конструктивен
6. КРИТИЧНО: ответ ПОЛНОСТЬЮ на русском языке!

Язык: РУССКИЙ (обязательно)";

// ============================================================================
// GenerationBackend Trait
// ============================================================================

/// 생성 파라미터
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
}

/// 생성 백엔드 트레이트 (단일 비스트리밍 호출)
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, prompt: &str, params: GenerationParams) -> Result<String>;

    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Generator
// ============================================================================

/// Ollama `/api/generate` 백엔드
#[derive(Debug)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    gate: HttpGate,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

impl OllamaGenerator {
    pub fn new(settings: &Settings, gate: HttpGate) -> Result<Self> {
        let endpoint = settings
            .ollama_host
            .join("api/generate")
            .context("Failed to build generate endpoint")?;

        tracing::info!("LLM ready: {} @ {}", settings.llm_model, settings.ollama_host);

        Ok(Self {
            client: build_client(settings.llm_timeout)?,
            endpoint,
            model: settings.llm_model.clone(),
            gate,
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    async fn generate(&self, prompt: &str, params: GenerationParams) -> Result<String> {
        let _permit = self.gate.acquire().await?;

        tracing::debug!(
            "LLM request (max_tokens={}, temperature={}, top_k={})",
            params.max_tokens,
            params.temperature,
            params.top_k
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
                options: GenerateOptions {
                    num_predict: params.max_tokens,
                    temperature: params.temperature,
                    top_k: params.top_k,
                },
            })
            .send()
            .await
            .context("Failed to send generate request")?
            .error_for_status()
            .context("Generate API error")?;

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse generate response")?;

        Ok(body.response.unwrap_or_default().trim().to_string())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// AnswerGenerator
// ============================================================================

/// 이어쓰기 상태
#[derive(Debug)]
enum AnswerState {
    Generated(String),
    CheckIncomplete { answer: String, retries: u32 },
    Continuing { answer: String, retries: u32 },
    Done(String),
}

/// 모드 인식 답변 생성기
pub struct AnswerGenerator {
    backend: Arc<dyn GenerationBackend>,
    modes: ModeTable,
    blank_lines: Regex,
}

impl AnswerGenerator {
    pub fn new(backend: Arc<dyn GenerationBackend>, modes: ModeTable) -> Result<Self> {
        Ok(Self {
            backend,
            modes,
            blank_lines: Regex::new(r"\n{3,}").context("Invalid blank line pattern")?,
        })
    }

    pub fn model_name(&self) -> &str {
        self.backend.name()
    }

    /// 모드에 맞는 생성 파라미터 (short 모드는 120 토큰 상한)
    pub fn params_for(&self, mode: Mode) -> GenerationParams {
        let cfg = self.modes.get(mode);
        let mut max_tokens = cfg.num_predict;
        if mode == Mode::Short {
            max_tokens = max_tokens.min(SHORT_MODE_TOKEN_CAP);
        }

        GenerationParams {
            max_tokens,
            temperature: cfg.temperature,
            top_k: cfg.top_k,
        }
    }

    /// 답변 생성
    ///
    /// 실패 시 빈 문자열을 반환합니다. 호출자는 빈 문자열을 "답변 없음"으로 처리합니다.
    pub async fn generate(&self, prompt: &str, context: &str, mode: Mode) -> String {
        let params = self.params_for(mode);
        let full_prompt = build_full_prompt(prompt, context);

        let answer = self.call(&full_prompt, params).await;
        if answer.is_empty() {
            return String::new();
        }

        let mut state = AnswerState::Generated(self.clean_answer(&answer));
        loop {
            state = match state {
                AnswerState::Generated(answer) => {
                    if mode == Mode::Short {
                        AnswerState::Done(answer)
                    } else {
                        AnswerState::CheckIncomplete { answer, retries: 0 }
                    }
                }
                AnswerState::CheckIncomplete { answer, retries } => {
                    if retries < MAX_CONTINUATION_RETRIES
                        && looks_incomplete(&answer, params.max_tokens)
                    {
                        AnswerState::Continuing { answer, retries }
                    } else {
                        if retries > 0 {
                            tracing::info!(
                                "Answer ready ({} chars, mode {})",
                                answer.chars().count(),
                                mode
                            );
                        }
                        AnswerState::Done(answer)
                    }
                }
                AnswerState::Continuing { answer, retries } => {
                    let retries = retries + 1;
                    tracing::info!(
                        "Continuation {}/{} (mode {})",
                        retries,
                        MAX_CONTINUATION_RETRIES,
                        mode
                    );

                    match self.continue_answer(&answer, params).await {
                        Some(continuation) => {
                            tracing::info!(
                                "Continuation appended {} chars",
                                continuation.chars().count()
                            );
                            AnswerState::CheckIncomplete {
                                answer: format!("{}\n\n{}", answer, continuation),
                                retries,
                            }
                        }
                        None => AnswerState::Done(answer),
                    }
                }
                AnswerState::Done(answer) => return answer,
            };
        }
    }

    /// 이어쓰기 요청, 채택할 수 없으면 `None`
    async fn continue_answer(&self, answer: &str, params: GenerationParams) -> Option<String> {
        let prompt = format!(
            "{}\n\n[Пользователь просит подробный ответ. \
             Продолжи ответ естественно, без повторений. \
             Если ответ уже закончен логично, просто скажи что он полный.]\n\n\
             ПРЕДЫДУЩИЙ ОТВЕТ (может быть обрезан):\n{}",
            SYSTEM_PROMPT, answer
        );

        let continuation = self
            .call(
                &prompt,
                GenerationParams {
                    max_tokens: params.max_tokens / 2,
                    ..params
                },
            )
            .await;

        if continuation.is_empty() {
            tracing::warn!("Continuation returned an empty response");
            return None;
        }

        let continuation = self.clean_answer(&continuation);
        if continuation.chars().count() < MIN_CONTINUATION_CHARS
            || answer
                .to_lowercase()
                .contains(&continuation.to_lowercase())
        {
            tracing::info!("Continuation repeated the answer or was too short, stopping");
            return None;
        }

        Some(continuation)
    }

    /// 백엔드 호출, 오류는 빈 문자열
    async fn call(&self, prompt: &str, params: GenerationParams) -> String {
        match self.backend.generate(prompt, params).await {
            Ok(answer) if answer.trim().is_empty() => {
                tracing::warn!("LLM returned an empty response");
                String::new()
            }
            Ok(answer) => {
                tracing::info!("LLM answered ({} chars)", answer.chars().count());
                answer
            }
            Err(e) => {
                let transport = e.chain().find_map(|c| c.downcast_ref::<reqwest::Error>());
                match transport {
                    Some(err) if err.is_timeout() => {
                        tracing::error!("Timeout: Ollama is not responding")
                    }
                    Some(err) if err.is_connect() => {
                        tracing::error!("Connection error: Ollama is not running")
                    }
                    _ => tracing::error!("LLM error: {:#}", e),
                }
                String::new()
            }
        }
    }

    /// 가벼운 출력 정리: 3개 이상 연속 개행 축소, 줄 끝 공백 제거
    pub fn clean_answer(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let collapsed = self.blank_lines.replace_all(text, "\n\n");
        collapsed
            .split('\n')
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// 시스템 지시문 + 컨텍스트(프롬프트에 아직 없을 때만) + 프롬프트
fn build_full_prompt(prompt: &str, context: &str) -> String {
    let context = context.trim();
    if context.is_empty() || prompt.contains(context) {
        format!("{}\n\n{}", SYSTEM_PROMPT, prompt)
    } else {
        format!("{}\n\nИнформация:\n{}\n\n{}", SYSTEM_PROMPT, context, prompt)
    }
}

/// 응답이 잘린 것처럼 보이는지
///
/// 끝 문자열이 종결 표시가 아니고, 예상 토큰 수가 `max_tokens`의 85%를 넘을 때.
pub fn looks_incomplete(text: &str, max_tokens: u32) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }

    let tail_start = trimmed
        .char_indices()
        .rev()
        .nth(TAIL_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let tail = &trimmed[tail_start..];
    if TERMINAL_MARKERS.iter().any(|marker| tail.ends_with(marker)) {
        return false;
    }

    let estimated_tokens = text.chars().count() as f64 / CHARS_PER_TOKEN;
    let ratio = if max_tokens > 0 {
        estimated_tokens / f64::from(max_tokens)
    } else {
        0.0
    };

    if ratio > INCOMPLETE_THRESHOLD {
        tracing::warn!("Answer looks truncated ({:.1}% of limit)", ratio * 100.0);
        return true;
    }

    false
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 정해진 응답을 순서대로 돌려주고 호출을 기록하는 백엔드
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String, String>>>,
        pub calls: Mutex<Vec<(String, GenerationParams)>>,
    }

    impl ScriptedGenerator {
        pub fn new<S: AsRef<str>>(responses: impl IntoIterator<Item = S>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| Ok(r.as_ref().to_string()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(vec![Err("backend down".to_string())])),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn params(&self, index: usize) -> GenerationParams {
            self.calls.lock().unwrap()[index].1
        }

        pub fn prompt(&self, index: usize) -> String {
            self.calls.lock().unwrap()[index].0.clone()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedGenerator {
        async fn generate(&self, prompt: &str, params: GenerationParams) -> Result<String> {
            self.calls.lock().unwrap().push((prompt.to_string(), params));
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Ok(String::new()),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn generator(backend: &Arc<ScriptedGenerator>) -> AnswerGenerator {
        AnswerGenerator::new(backend.clone(), ModeTable::default()).unwrap()
    }

    /// default 모드(1000 토큰)에서 잘린 것으로 판단되는 답변
    fn truncated_answer() -> String {
        format!("{} and then", "a".repeat(3000))
    }

    #[tokio::test]
    async fn test_short_mode_caps_max_tokens() {
        let backend = Arc::new(ScriptedGenerator::new(vec!["Короткий ответ."]));
        let gen = generator(&backend);

        let answer = gen.generate("вопрос", "", Mode::Short).await;
        assert_eq!(answer, "Короткий ответ.");
        assert_eq!(backend.params(0).max_tokens, 120);
        assert!((backend.params(0).temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(backend.params(0).top_k, 2);
    }

    #[tokio::test]
    async fn test_short_mode_never_continues() {
        let long = "a".repeat(400);
        let backend = Arc::new(ScriptedGenerator::new(vec![long.as_str(), "never used continuation text"]));
        let gen = generator(&backend);

        let answer = gen.generate("вопрос", "", Mode::Short).await;
        assert_eq!(answer, long);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_continuation_is_discarded() {
        let first = truncated_answer();
        let duplicate = "A".repeat(60);
        let backend = Arc::new(ScriptedGenerator::new(vec![&first, &duplicate]));
        let gen = generator(&backend);

        let answer = gen.generate("вопрос", "", Mode::Default).await;
        assert_eq!(answer, first);
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.params(1).max_tokens, 500);
        assert!(backend.prompt(1).contains("ПРЕДЫДУЩИЙ ОТВЕТ"));
    }

    #[tokio::test]
    async fn test_valid_continuation_is_appended() {
        let first = truncated_answer();
        let continuation = "This fresh continuation finishes the thought in a proper way.";
        let backend = Arc::new(ScriptedGenerator::new(vec![first.as_str(), continuation]));
        let gen = generator(&backend);

        let answer = gen.generate("вопрос", "", Mode::Detailed).await;
        // detailed: 2000 토큰, 3000자 답변은 잘림으로 보지 않음
        assert_eq!(answer, first);
        assert_eq!(backend.call_count(), 1);

        let backend = Arc::new(ScriptedGenerator::new(vec![first.as_str(), continuation]));
        let gen = generator(&backend);
        let answer = gen.generate("вопрос", "", Mode::Default).await;
        assert_eq!(answer, format!("{}\n\n{}", first, continuation));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_continuation_retry_cap() {
        let first = truncated_answer();
        let second = "b".repeat(100);
        let third = "c".repeat(100);
        let backend = Arc::new(ScriptedGenerator::new(vec![
            first.as_str(),
            second.as_str(),
            third.as_str(),
            "d never requested",
        ]));
        let gen = generator(&backend);

        let answer = gen.generate("вопрос", "", Mode::Default).await;
        assert_eq!(answer, format!("{}\n\n{}\n\n{}", first, second, third));
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_short_or_empty_continuation_stops() {
        let first = truncated_answer();
        let backend = Arc::new(ScriptedGenerator::new(vec![first.as_str(), "too short"]));
        let gen = generator(&backend);
        assert_eq!(gen.generate("вопрос", "", Mode::Default).await, first);

        let backend = Arc::new(ScriptedGenerator::new(vec![&first]));
        let gen = generator(&backend);
        assert_eq!(gen.generate("вопрос", "", Mode::Default).await, first);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_backend_error_yields_empty() {
        let backend = Arc::new(ScriptedGenerator::failing());
        let gen = generator(&backend);
        assert_eq!(gen.generate("вопрос", "", Mode::Default).await, "");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_context_added_once() {
        let backend = Arc::new(ScriptedGenerator::new(vec!["Ответ.", "Ответ."]));
        let gen = generator(&backend);

        gen.generate("Вопрос: что такое Rust?", "Rust - язык", Mode::Default)
            .await;
        assert!(backend.prompt(0).contains("Информация:\nRust - язык"));

        gen.generate("Информация:\nRust - язык\n\nВопрос", "Rust - язык", Mode::Default)
            .await;
        assert_eq!(backend.prompt(1).matches("Rust - язык").count(), 1);
    }

    #[test]
    fn test_clean_answer() {
        let backend = Arc::new(ScriptedGenerator::default());
        let gen = generator(&backend);

        assert_eq!(gen.clean_answer(""), "");
        assert_eq!(
            gen.clean_answer("  first   \n\n\n\nsecond\t\nthird  \n\n"),
            "first\n\nsecond\nthird"
        );
    }

    #[test]
    fn test_looks_incomplete() {
        // 3000자 / 3.5 = 857 > 850
        assert!(looks_incomplete(&"a".repeat(3000), 1000));
        // 2975자 / 3.5 = 850, 초과 아님
        assert!(!looks_incomplete(&"a".repeat(2975), 1000));

        for marker in [".", "!", "?", "```", "`", "\"", "»", ")", "]", "}"] {
            let text = format!("{}{}", "a".repeat(3000), marker);
            assert!(!looks_incomplete(&text, 1000), "marker {}", marker);
        }

        // 문자 단위 길이 (키릴 문자)
        assert!(looks_incomplete(&"я".repeat(3000), 1000));

        assert!(!looks_incomplete("", 1000));
        assert!(!looks_incomplete("abc", 0));
    }
}

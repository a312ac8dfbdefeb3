//! 설정 모듈 - 환경변수(.env) 기반 런타임 설정
//!
//! 프로세스 시작 시 한 번 로드되고 이후에는 읽기 전용입니다.
//! 잘못된 값(숫자 파싱 실패, 잘못된 URL 등)은 시작 단계의 치명적 오류로 처리합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! dotenvy::dotenv().ok();
//! let settings = Settings::from_env()?;
//! let cfg = settings.modes.get(Mode::Short);
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::knowledge::get_data_dir;

// ============================================================================
// Errors
// ============================================================================

/// 시작 단계 설정 오류 (프로세스 시작 중단)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key}: invalid URL '{value}': {source}")]
    InvalidUrl {
        key: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{key} must not be empty")]
    Empty { key: &'static str },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

// ============================================================================
// Mode
// ============================================================================

/// 답변 모드 (길이/톤 프로필)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Short,
    #[default]
    Default,
    Detailed,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Short, Mode::Default, Mode::Detailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Short => "short",
            Mode::Default => "default",
            Mode::Detailed => "detailed",
        }
    }

    /// 이름으로 모드 결정, 알 수 없는 이름이면 경고 후 `Default`
    pub fn from_name_or_default(name: &str) -> Self {
        match name.parse() {
            Ok(mode) => mode,
            Err(_) => {
                tracing::warn!("Unknown mode '{}', falling back to 'default'", name);
                Mode::Default
            }
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "short" => Ok(Mode::Short),
            "default" => Ok(Mode::Default),
            "detailed" => Ok(Mode::Detailed),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ModeConfig
// ============================================================================

/// 모드별 생성/검색 파라미터
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeConfig {
    /// 표시 이름
    pub name: &'static str,
    /// 목표 분량 설명
    pub description: &'static str,
    /// 최대 생성 토큰 수
    pub num_predict: u32,
    pub temperature: f32,
    pub top_k: u32,
    /// 벡터 DB 검색 여부
    pub db_search: bool,
    /// 웹 검색 여부
    pub web_search: bool,
    /// 웹 검색 결과 개수
    pub web_search_results: usize,
    pub target_length: usize,
    pub min_length: usize,
    pub max_length: usize,
}

impl ModeConfig {
    pub fn short() -> Self {
        Self {
            name: "Кратко",
            description: "2-3 предложения",
            num_predict: 300,
            temperature: 0.2,
            top_k: 2,
            db_search: true,
            web_search: true,
            web_search_results: 2,
            target_length: 100,
            min_length: 50,
            max_length: 200,
        }
    }

    pub fn default_mode() -> Self {
        Self {
            name: "Нормально",
            description: "800-1000 слов",
            num_predict: 1000,
            temperature: 0.5,
            top_k: 3,
            db_search: true,
            web_search: true,
            web_search_results: 3,
            target_length: 900,
            min_length: 500,
            max_length: 1500,
        }
    }

    pub fn detailed() -> Self {
        Self {
            name: "Подробно",
            description: "1500-2500 слов",
            num_predict: 2000,
            temperature: 0.7,
            top_k: 5,
            db_search: true,
            web_search: true,
            web_search_results: 5,
            target_length: 2000,
            min_length: 1200,
            max_length: 3500,
        }
    }

    /// JSON 오버라이드 적용 (지정된 필드만 교체)
    fn apply(mut self, patch: ModeOverride) -> Self {
        if let Some(v) = patch.num_predict {
            self.num_predict = v;
        }
        if let Some(v) = patch.temperature {
            self.temperature = v;
        }
        if let Some(v) = patch.top_k {
            self.top_k = v;
        }
        if let Some(v) = patch.db_search {
            self.db_search = v;
        }
        if let Some(v) = patch.web_search {
            self.web_search = v;
        }
        if let Some(v) = patch.web_search_results {
            self.web_search_results = v;
        }
        self
    }
}

/// `MODE_*` 환경변수의 JSON 오버라이드
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModeOverride {
    num_predict: Option<u32>,
    temperature: Option<f32>,
    top_k: Option<u32>,
    db_search: Option<bool>,
    web_search: Option<bool>,
    web_search_results: Option<usize>,
}

/// 오버라이드 파싱 - 실패하면 경고 후 기본값 유지
fn parse_mode_override(key: &str, raw: Option<String>, default: ModeConfig) -> ModeConfig {
    let Some(raw) = raw else {
        return default;
    };

    let trimmed = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if trimmed.is_empty() {
        return default;
    }

    match serde_json::from_str::<ModeOverride>(trimmed) {
        Ok(patch) if patch.temperature.map(|t| t < 0.0).unwrap_or(false) => {
            tracing::warn!("{}: negative temperature, using defaults", key);
            default
        }
        Ok(patch) => default.apply(patch),
        Err(e) => {
            tracing::warn!("Failed to parse {}: {}, using defaults", key, e);
            default
        }
    }
}

/// 세 가지 모드 설정 (정확히 세 개만 존재)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeTable {
    pub short: ModeConfig,
    pub default: ModeConfig,
    pub detailed: ModeConfig,
}

impl ModeTable {
    pub fn get(&self, mode: Mode) -> &ModeConfig {
        match mode {
            Mode::Short => &self.short,
            Mode::Default => &self.default,
            Mode::Detailed => &self.detailed,
        }
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self {
            short: ModeConfig::short(),
            default: ModeConfig::default_mode(),
            detailed: ModeConfig::detailed(),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// 로깅 설정 (다른 설정보다 먼저 필요)
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    /// `None`이면 파일 로그 비활성화
    pub dir: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let dir = match lookup("LOG_DIR") {
            Some(dir) if dir.trim().is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => Some(PathBuf::from("logs")),
        };

        Self {
            level: lookup("LOG_LEVEL")
                .filter(|level| !level.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            dir,
        }
    }
}

/// 벡터 인덱스 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Lance,
    Memory,
}

/// 전체 런타임 설정
#[derive(Debug, Clone)]
pub struct Settings {
    pub ollama_host: Url,
    pub llm_model: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub embedding_batch_size: usize,
    pub embedding_cache_size: usize,

    pub llm_timeout: Duration,
    pub embedding_timeout: Duration,
    pub web_search_timeout: Duration,
    pub web_search_results: usize,
    /// 외부 호출 동시성 상한
    pub max_workers: usize,

    pub vector_backend: VectorBackend,
    pub vector_db_path: PathBuf,
    pub collection_name: String,
    pub db_search_top_k: usize,
    pub similarity_threshold: f32,
    pub max_context_chars: usize,
    pub auto_add_sources: bool,
    pub auto_cleanup: bool,
    pub cleanup_days: u32,
    /// `None`이면 주기적 정리 비활성
    pub cleanup_interval: Option<Duration>,

    pub log_level: String,
    pub log_dir: Option<PathBuf>,

    pub modes: ModeTable,
}

impl Settings {
    /// 프로세스 환경변수에서 로드
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 임의의 조회 함수에서 로드 (테스트에서 맵 주입)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let host_raw = env.string("OLLAMA_HOST", "http://127.0.0.1:11434");
        let ollama_host = Url::parse(&host_raw).map_err(|source| ConfigError::InvalidUrl {
            key: "OLLAMA_HOST",
            value: host_raw.clone(),
            source,
        })?;

        let request_timeout = env.parse::<u64>("REQUEST_TIMEOUT")?;
        let llm_timeout = env.parse::<u64>("LLM_TIMEOUT")?.or(request_timeout).unwrap_or(120);
        let embedding_timeout = env
            .parse::<u64>("EMBEDDING_TIMEOUT")?
            .or(request_timeout)
            .unwrap_or(30);
        let web_search_timeout = env.parse::<u64>("WEB_SEARCH_TIMEOUT")?.unwrap_or(8);

        let vector_backend = match env.string("VECTOR_BACKEND", "lance").to_lowercase().as_str() {
            "lance" | "lancedb" => VectorBackend::Lance,
            "memory" => VectorBackend::Memory,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "VECTOR_BACKEND",
                    value: other.to_string(),
                    reason: "expected 'lance' or 'memory'".to_string(),
                })
            }
        };

        let vector_db_path = env
            .first(&["VECTOR_DB_PATH", "CHROMA_PATH"])
            .map(PathBuf::from)
            .unwrap_or_else(|| get_data_dir().join("vectors.lance"));

        let cleanup_hours = env.parse::<u64>("DB_CLEANUP_INTERVAL_HOURS")?.unwrap_or(0);
        let cleanup_interval = match cleanup_hours {
            0 => None,
            hours => {
                let secs = hours.checked_mul(3600).ok_or_else(|| ConfigError::InvalidValue {
                    key: "DB_CLEANUP_INTERVAL_HOURS",
                    value: hours.to_string(),
                    reason: "interval is too large".to_string(),
                })?;
                Some(Duration::from_secs(secs))
            }
        };

        let logging = LogSettings::from_lookup(&lookup);

        let modes = ModeTable {
            short: parse_mode_override("MODE_SHORT", lookup("MODE_SHORT"), ModeConfig::short()),
            default: parse_mode_override(
                "MODE_DEFAULT",
                lookup("MODE_DEFAULT"),
                ModeConfig::default_mode(),
            ),
            detailed: parse_mode_override(
                "MODE_DETAILED",
                lookup("MODE_DETAILED"),
                ModeConfig::detailed(),
            ),
        };

        let similarity_threshold = env.parse::<f32>("SIMILARITY_THRESHOLD")?.unwrap_or(0.35);
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "SIMILARITY_THRESHOLD",
                value: similarity_threshold.to_string(),
                reason: "must be within 0.0..=1.0".to_string(),
            });
        }

        let settings = Self {
            ollama_host,
            llm_model: env.string("LLM_MODEL", "neural-chat"),
            embedding_model: env.string("EMBEDDING_MODEL", "nomic-embed-text"),
            embedding_dimension: env.parse("EMBEDDING_DIMENSION")?.unwrap_or(768),
            embedding_batch_size: env.parse("EMBEDDING_BATCH_SIZE")?.unwrap_or(10),
            embedding_cache_size: env.parse("EMBEDDING_CACHE_SIZE")?.unwrap_or(1000),
            llm_timeout: Duration::from_secs(llm_timeout),
            embedding_timeout: Duration::from_secs(embedding_timeout),
            web_search_timeout: Duration::from_secs(web_search_timeout),
            web_search_results: env.parse("WEB_SEARCH_RESULTS")?.unwrap_or(5),
            max_workers: env.parse("MAX_WORKERS")?.unwrap_or(8),
            vector_backend,
            vector_db_path,
            collection_name: env
                .first(&["COLLECTION_NAME", "CHROMA_COLLECTION_NAME"])
                .unwrap_or_else(|| "documents".to_string()),
            db_search_top_k: match env.first(&["DB_SEARCH_TOPK", "CHROMA_SEARCH_TOPK"]) {
                Some(raw) => parse_value("DB_SEARCH_TOPK", &raw)?,
                None => 5,
            },
            similarity_threshold,
            max_context_chars: env.parse("MAX_CONTEXT_CHARS")?.unwrap_or(12_000),
            auto_add_sources: env.flag("DB_AUTO_ADD_SOURCES", true),
            auto_cleanup: env.flag("DB_AUTO_CLEANUP", false),
            cleanup_days: env.parse("DB_CLEANUP_DAYS")?.unwrap_or(60),
            cleanup_interval,
            log_level: logging.level,
            log_dir: logging.dir,
            modes,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.llm_model.trim().is_empty() {
            return Err(ConfigError::Empty { key: "LLM_MODEL" });
        }
        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::Empty {
                key: "EMBEDDING_MODEL",
            });
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::Empty {
                key: "COLLECTION_NAME",
            });
        }

        let non_zero = [
            ("MAX_WORKERS", self.max_workers),
            ("EMBEDDING_DIMENSION", self.embedding_dimension),
            ("EMBEDDING_BATCH_SIZE", self.embedding_batch_size),
            ("LLM_TIMEOUT", self.llm_timeout.as_secs() as usize),
            ("EMBEDDING_TIMEOUT", self.embedding_timeout.as_secs() as usize),
            ("WEB_SEARCH_TIMEOUT", self.web_search_timeout.as_secs() as usize),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { key });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key).map(|raw| parse_value(key, &raw)).transpose()
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

// ============================================================================
// Tests
// ============================================================================

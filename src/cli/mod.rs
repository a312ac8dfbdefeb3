//! CLI 모듈
//!
//! ragbot CLI 명령어 정의 및 구현. 채팅 전송 계층 대신 표준 입출력을 사용합니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{Mode, Settings, VectorBackend};
use crate::embedding::{EmbeddingService, OllamaEmbedding};
use crate::http::HttpGate;
use crate::knowledge::{
    get_data_dir, DocumentStore, LanceVectorIndex, MemoryVectorIndex, RawDocument, StoreOptions,
    VectorIndex,
};
use crate::llm::{AnswerGenerator, OllamaGenerator};
use crate::pipeline::{PipelineOptions, RagPipeline};
use crate::search::{WebSearch, WebSearchClient};

/// 종료 시 백그라운드 저장 대기 시간
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "ragbot")]
#[command(version, about = "웹 검색 + 벡터 DB 기반 RAG 답변 봇", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 질문 한 번 처리
    Ask {
        /// 질문
        query: String,

        /// 답변 모드 (short, default, detailed)
        #[arg(short, long, default_value = "default")]
        mode: Mode,
    },

    /// 대화형 모드 (`/mode <이름>`으로 모드 전환, `/quit`로 종료)
    Chat {
        /// 시작 모드
        #[arg(short, long, default_value = "default")]
        mode: Mode,
    },

    /// 지식베이스에 문서 추가
    Ingest {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 텍스트 파일 경로 (빈 줄 기준으로 분할)
        #[arg(long)]
        file: Option<PathBuf>,

        /// 출처 태그
        #[arg(short, long, default_value = "manual")]
        source: String,
    },

    /// 지식베이스 검색 (컨텍스트 원문 출력)
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// 웹 검색만 실행
    Web {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// 오래된 문서 삭제
    Cleanup {
        /// 기준 일수 (기본값: DB_CLEANUP_DAYS)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// 모든 문서 삭제
    Clear,

    /// 상태 확인
    Status,
}

// ============================================================================
// Services
// ============================================================================

/// 프로세스 단위 서비스 묶음 (한 번 생성 후 공유)
struct Services {
    embeddings: Arc<EmbeddingService>,
    store: Arc<DocumentStore>,
    web: Arc<WebSearchClient>,
    generator: Arc<AnswerGenerator>,
    pipeline: RagPipeline,
    gate: HttpGate,
}

impl Services {
    async fn build(settings: &Settings) -> Result<Self> {
        let gate = HttpGate::new(settings.max_workers);

        let backend = OllamaEmbedding::new(settings, gate.clone())
            .context("Embedding backend 초기화 실패")?;
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(backend),
            settings.embedding_cache_size,
            settings.embedding_dimension,
        ));

        let index: Arc<dyn VectorIndex> = match settings.vector_backend {
            VectorBackend::Lance => Arc::new(
                LanceVectorIndex::open(
                    &settings.vector_db_path,
                    &settings.collection_name,
                    settings.embedding_dimension,
                )
                .await
                .context("벡터 DB 열기 실패")?,
            ),
            VectorBackend::Memory => Arc::new(MemoryVectorIndex::new()),
        };

        let store = Arc::new(DocumentStore::new(
            index,
            embeddings.clone(),
            StoreOptions {
                collection_name: settings.collection_name.clone(),
                similarity_threshold: settings.similarity_threshold,
                embedding_batch_size: settings.embedding_batch_size,
            },
        ));

        let web = Arc::new(
            WebSearchClient::new(settings, gate.clone()).context("웹 검색 클라이언트 생성 실패")?,
        );

        let llm = OllamaGenerator::new(settings, gate.clone()).context("LLM 클라이언트 생성 실패")?;
        let generator = Arc::new(AnswerGenerator::new(Arc::new(llm), settings.modes.clone())?);

        let pipeline = RagPipeline::new(
            store.clone(),
            web.clone() as Arc<dyn WebSearch>,
            generator.clone(),
            settings.modes.clone(),
            PipelineOptions::from_settings(settings),
        );

        Ok(Self {
            embeddings,
            store,
            web,
            generator,
            pipeline,
            gate,
        })
    }

    /// DB_AUTO_CLEANUP이 켜져 있으면 시작 시 1회 정리
    async fn startup_cleanup(&self, settings: &Settings) {
        if settings.auto_cleanup {
            let deleted = self.store.delete_old_documents(settings.cleanup_days).await;
            tracing::info!(
                "Startup cleanup removed {} documents older than {} days",
                deleted,
                settings.cleanup_days
            );
        }
    }

    /// 남은 백그라운드 저장 대기
    async fn shutdown(&self) {
        if !self.pipeline.background().drain(SHUTDOWN_DRAIN_TIMEOUT).await {
            println!("[!] 일부 백그라운드 저장이 완료되지 않았습니다.");
        }
    }
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Commands::Ask { query, mode } => cmd_ask(&settings, &query, mode).await,
        Commands::Chat { mode } => cmd_chat(&settings, mode).await,
        Commands::Ingest { text, file, source } => cmd_ingest(&settings, text, file, &source).await,
        Commands::Query { query, limit } => cmd_query(&settings, &query, limit).await,
        Commands::Web { query, limit } => cmd_web(&settings, &query, limit).await,
        Commands::Cleanup { days } => cmd_cleanup(&settings, days).await,
        Commands::Clear => cmd_clear(&settings).await,
        Commands::Status => cmd_status(&settings).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 질문 명령어 (ask)
async fn cmd_ask(settings: &Settings, query: &str, mode: Mode) -> Result<()> {
    let services = Services::build(settings).await?;
    services.startup_cleanup(settings).await;

    println!("[*] 처리 중 ({}): \"{}\"", mode, truncate_text(query, 60));
    let answer = services.pipeline.process(query, mode).await;
    println!("\n{}\n", answer);

    services.shutdown().await;
    Ok(())
}

/// 대화형 명령어 (chat)
///
/// 한 줄이 한 요청입니다. 처리 중 Ctrl+C는 현재 요청만 취소합니다.
async fn cmd_chat(settings: &Settings, initial_mode: Mode) -> Result<()> {
    let services = Services::build(settings).await?;
    services.startup_cleanup(settings).await;

    let cleanup_task = settings.cleanup_interval.map(|interval| {
        services
            .store
            .spawn_periodic_cleanup(interval, settings.cleanup_days)
    });

    let mut mode = initial_mode;
    println!("ragbot v{} (모드: {})", env!("CARGO_PKG_VERSION"), mode);
    println!("질문을 입력하세요. /mode <short|default|detailed>, /quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("입력 읽기 실패")? {
        let line = line.trim();

        if line == "/quit" || line == "/exit" {
            break;
        }

        if let Some(name) = line.strip_prefix("/mode") {
            let name = name.trim();
            if name.is_empty() {
                println!("[*] 현재 모드: {}", mode);
                for m in Mode::ALL {
                    println!("    {:<9} {}", m.as_str(), settings.modes.get(m).description);
                }
            } else {
                // 알 수 없는 이름은 경고 후 default
                mode = Mode::from_name_or_default(name);
                println!("[OK] 모드 변경: {}", mode);
            }
            continue;
        }

        tokio::select! {
            answer = services.pipeline.process(line, mode) => {
                println!("\n{}\n", answer);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n[!] 요청이 취소되었습니다.\n");
            }
        }
    }

    if let Some(task) = cleanup_task {
        task.abort();
    }
    services.shutdown().await;
    Ok(())
}

/// 문서 추가 명령어 (ingest)
async fn cmd_ingest(
    settings: &Settings,
    text: Option<String>,
    file: Option<PathBuf>,
    source: &str,
) -> Result<()> {
    let documents: Vec<RawDocument> = if let Some(text) = text {
        vec![RawDocument::from(text)]
    } else if let Some(ref path) = file {
        read_document_file(path).await?
    } else {
        bail!("--text 또는 --file 중 하나를 지정해야 합니다");
    };

    let services = Services::build(settings).await?;

    println!("[*] 문서 {} 건 임베딩 및 저장 중...", documents.len());
    if services.store.add_documents(documents, source).await {
        let stats = services.store.stats().await;
        println!("[OK] 문서가 추가되었습니다 (총 {} 건)", stats.total_documents);
    } else {
        println!("[!] 추가된 문서가 없습니다 (10자 초과 텍스트만 저장, 임베딩 서비스 확인)");
    }

    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(settings: &Settings, query: &str, limit: usize) -> Result<()> {
    let services = Services::build(settings).await?;

    println!("[*] 검색 중: \"{}\"", query);
    let context = services.store.search(query, limit).await;

    if context.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
    } else {
        println!("\n{}", context);
    }

    Ok(())
}

/// 웹 검색 명령어 (web)
async fn cmd_web(settings: &Settings, query: &str, limit: usize) -> Result<()> {
    let services = Services::build(settings).await?;

    println!("[*] 웹 검색 중: \"{}\"", query);
    let results = services.web.search(query, limit).await;

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());
    for (i, result) in results.iter().enumerate() {
        println!("{}. {}", i + 1, result.title);
        println!("   URL: {}", result.url);
        println!("   스니펫: {}", truncate_text(&result.snippet, 200));
        println!();
    }

    Ok(())
}

/// 정리 명령어 (cleanup)
async fn cmd_cleanup(settings: &Settings, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(settings.cleanup_days);
    let services = Services::build(settings).await?;

    let deleted = services.store.delete_old_documents(days).await;
    println!("[OK] {}일 이전 문서 {} 건 삭제", days, deleted);

    Ok(())
}

/// 전체 삭제 명령어 (clear)
async fn cmd_clear(settings: &Settings) -> Result<()> {
    let services = Services::build(settings).await?;

    if services.store.clear().await {
        services.embeddings.clear_cache();
        println!("[OK] 지식베이스를 비웠습니다.");
    } else {
        println!("[!] 지식베이스 삭제 실패 (로그 확인)");
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(settings: &Settings) -> Result<()> {
    println!("ragbot v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", get_data_dir().display());
    println!("[*] Ollama: {}", settings.ollama_host);
    println!("[*] 최대 동시 외부 호출: {}", settings.max_workers);
    println!("[*] 유사도 임계값: {:.2}", settings.similarity_threshold);
    println!();

    println!("[*] 모드:");
    for mode in Mode::ALL {
        let cfg = settings.modes.get(mode);
        println!(
            "    {:<9} tokens={:<5} temp={:.1} top_k={} db={} web={}({}) - {}",
            mode.as_str(),
            cfg.num_predict,
            cfg.temperature,
            cfg.top_k,
            cfg.db_search,
            cfg.web_search,
            cfg.web_search_results,
            cfg.description
        );
    }
    println!();

    let services = match Services::build(settings).await {
        Ok(services) => services,
        Err(e) => {
            println!("[!] 서비스 초기화 실패: {:#}", e);
            return Ok(());
        }
    };

    println!("[OK] LLM: {}", services.generator.model_name());
    println!(
        "[OK] 임베딩: {} (차원 {}, 캐시 {} 건)",
        services.embeddings.model_name(),
        services.embeddings.dimension(),
        services.embeddings.cache_len()
    );
    println!("[OK] 외부 호출 여유: {}/{}", services.gate.available(), services.gate.limit());

    let stats = services.store.stats().await;
    println!(
        "[OK] 저장된 문서: {} 건 (컬렉션 {}, {})",
        stats.total_documents, stats.collection_name, stats.path
    );

    let info = services.store.collection_info().await;
    for (source, count) in &info.sources {
        println!("     {:<12} {} 건", source, count);
    }
    if let (Some(oldest), Some(newest)) = (&info.oldest, &info.newest) {
        println!("     기간: {} ~ {}", oldest, newest);
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 파일을 읽어 빈 줄 기준으로 문서 분할
async fn read_document_file(path: &Path) -> Result<Vec<RawDocument>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;

    Ok(split_paragraphs(&content)
        .into_iter()
        .map(RawDocument::from)
        .collect())
}

/// 빈 줄(공백만 있는 줄 포함) 기준 문단 분할
fn split_paragraphs(content: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

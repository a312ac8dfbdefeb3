//! ragbot CLI 진입점

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // .env 파일 (없어도 됨)
    let _ = dotenvy::dotenv();

    let cli = ragbot::cli::Cli::parse();

    // 로깅 초기화 (guard는 종료 시까지 유지)
    let logging = ragbot::config::LogSettings::from_env();
    let _guard = init_logging(&logging.level, logging.dir.as_deref());

    let settings = ragbot::Settings::from_env().context("설정 오류")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(ragbot::cli::run(cli, settings))
}

/// 콘솔(stderr) + 일별 로그 파일
///
/// RUST_LOG가 있으면 LOG_LEVEL보다 우선합니다.
fn init_logging(log_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "ragbot.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("[!] 로그 디렉토리 생성 실패 ({}): {}", dir.display(), e);
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

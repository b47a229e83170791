//! 日志系统模块职责：
//! 1. 初始化控制台 + 文件双通道 tracing 日志，desktop / mobile 共用。
//! 2. 运行日志按天滚动落在 `logs/` 目录。
//! 3. CLI 型服务可把控制台层切到 stderr，stdout 留给命令输出。

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// 默认日志目录（相对当前工作目录）。
const DEFAULT_LOG_DIR: &str = "logs";
/// 文件日志级别环境变量（独立于 `RUST_LOG`）。
const FILE_LOG_LEVEL_ENV: &str = "CS_FILE_LOG_LEVEL";

/// 日志运行时守卫，防止 non-blocking writer 提前析构。
pub struct LogRuntime {
    _console_guard: WorkerGuard,
    _file_guard: WorkerGuard,
}

/// 初始化日志系统。
///
/// `console_to_stderr` 为 true 时人类可读日志走 stderr；
/// `default_console_filter` 是 `RUST_LOG` 未设置时的控制台过滤。
pub fn init(
    service_name: &str,
    console_to_stderr: bool,
    default_console_filter: &str,
) -> Result<LogRuntime> {
    let log_dir = resolve_log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("create log dir: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (console_writer, console_guard) = if console_to_stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(console_writer)
        .with_ansi(true)
        .with_target(false)
        .compact()
        .with_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_console_filter)),
        );
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(resolve_file_level_filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(LogRuntime {
        _console_guard: console_guard,
        _file_guard: file_guard,
    })
}

/// 解析日志目录配置为绝对路径。
fn resolve_log_dir() -> PathBuf {
    let raw = std::env::var("CS_LOG_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string());
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(dir) => dir.join(path),
        Err(_) => PathBuf::from(DEFAULT_LOG_DIR),
    }
}

/// 文件日志默认保留 debug 级别，便于完整回放。
fn resolve_file_level_filter() -> LevelFilter {
    std::env::var(FILE_LOG_LEVEL_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::DEBUG)
}

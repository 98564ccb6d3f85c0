//! 日志系统初始化模块
//!
//! 基于tracing的统一初始化：级别优先取RUST_LOG环境变量，
//! 回退到配置文件；可选地同时输出到控制台和按天滚动的日志文件

use crate::klcommon::LoggingConfig;
use crate::klcommon::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志guard，由main持有直到进程结束，保证缓冲的日志被刷出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    // 压低基础设施库的噪音，业务日志级别由配置控制
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn",
            config.log_level
        ))
    });

    let console_layer = if config.enable_console_output {
        Some(fmt::layer().with_target(true))
    } else {
        None
    };

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "kline_upload_service.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

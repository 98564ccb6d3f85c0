// 导出共享模块
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod watchdog;
pub mod websocket;

// 重新导出常用类型，方便使用
pub use api::{interval_to_seconds, BinanceApi, HistoricalFeed};
pub use config::{DatabaseConfig, LoggingConfig, UploaderConfig};
pub use db::{AnalyticalStore, Database};
pub use error::{AppError, Result};
pub use logging_setup::{init_logging, LogGuard};
pub use models::{destination_id, format_bucket, AggRow, MarketType, MinuteBar};
pub use watchdog::Watchdog;
pub use websocket::{FeedEvent, KlineFeed};

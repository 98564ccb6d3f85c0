//! 上传服务配置模块

use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};

/// 默认启用控制台输出
fn default_enable_console_output() -> bool {
    true
}

/// 默认事件通道容量
fn default_channel_capacity() -> usize {
    100_000
}

/// K线上传服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 分析库数据集名称，表标识的前缀
    pub dataset: String,

    /// 市场与品种配置
    pub markets: MarketsConfig,

    /// 数据库配置
    pub database: DatabaseConfig,

    /// REST接口配置
    pub api: ApiConfig,

    /// WebSocket配置
    pub websocket: WebSocketConfig,

    /// 历史补齐配置
    pub backfill: BackfillConfig,

    /// 批量上传配置
    pub uploader: UploadTuningConfig,

    /// 看门狗配置
    pub watchdog: WatchdogConfig,

    /// 日志配置
    pub logging: LoggingConfig,
}

/// 市场与品种配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketsConfig {
    /// 现货品种列表
    #[serde(default)]
    pub spot_symbols: Vec<String>,

    /// 合约品种列表
    #[serde(default)]
    pub perp_symbols: Vec<String>,

    /// 现货聚合周期列表
    pub spot_intervals: Vec<String>,

    /// 合约聚合周期列表
    pub perp_intervals: Vec<String>,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 连接超时（秒）
    pub connection_timeout_secs: u64,

    /// 是否启用WAL模式
    pub enable_wal: bool,
}

/// REST接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 现货REST端点
    pub spot_url: String,

    /// 合约REST端点
    pub perp_url: String,
}

/// WebSocket配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// 现货流端点
    pub spot_url: String,

    /// 合约流端点
    pub perp_url: String,

    /// 事件通道容量
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// 历史补齐配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// 单页K线数量（REST接口上限1500）
    pub page_size: usize,
}

/// 批量上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTuningConfig {
    /// 写入失败后的固定重试间隔（秒）
    pub retry_delay_secs: u64,

    /// 队列为空时的空转间隔（秒）
    pub idle_delay_secs: u64,
}

/// 看门狗配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// 注册后到首次ping的宽限期（秒）
    pub start_grace_secs: u64,

    /// 相邻两次ping之间的超时阈值（秒）
    pub timeout_secs: u64,

    /// 检查循环的执行间隔（秒）
    pub check_interval_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录，不配置则只输出到控制台
    #[serde(default)]
    pub log_dir: Option<String>,

    /// 是否启用控制台输出
    #[serde(default = "default_enable_console_output")]
    pub enable_console_output: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/kline_upload.db".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            enable_wal: true,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { page_size: 1000 }
    }
}

impl Default for UploadTuningConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            idle_delay_secs: 5,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            start_grace_secs: 15 * 60,
            timeout_secs: 15 * 60,
            check_interval_secs: 60,
        }
    }
}

impl UploaderConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(AppError::IoError)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.markets.spot_symbols.is_empty() && self.markets.perp_symbols.is_empty() {
            return Err(AppError::ConfigError(
                "现货和合约品种列表不能同时为空".to_string(),
            ));
        }

        // 验证每个时间周期的格式
        let intervals = self
            .markets
            .spot_intervals
            .iter()
            .chain(self.markets.perp_intervals.iter());
        for interval in intervals {
            if crate::klcommon::api::interval_to_seconds(interval) <= 0 {
                return Err(AppError::ConfigError(format!("无效的时间周期: {}", interval)));
            }
        }

        if !self.markets.spot_symbols.is_empty() && self.markets.spot_intervals.is_empty() {
            return Err(AppError::ConfigError(
                "现货周期列表不能为空".to_string(),
            ));
        }
        if !self.markets.perp_symbols.is_empty() && self.markets.perp_intervals.is_empty() {
            return Err(AppError::ConfigError(
                "合约周期列表不能为空".to_string(),
            ));
        }

        if self.backfill.page_size == 0 || self.backfill.page_size > 1500 {
            return Err(AppError::ConfigError(
                "补齐单页数量必须在1到1500之间".to_string(),
            ));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError(
                "数据库连接池大小必须大于0".to_string(),
            ));
        }

        if self.uploader.retry_delay_secs == 0 || self.uploader.idle_delay_secs == 0 {
            return Err(AppError::ConfigError(
                "上传重试间隔和空转间隔必须大于0".to_string(),
            ));
        }

        if self.watchdog.timeout_secs == 0 || self.watchdog.check_interval_secs == 0 {
            return Err(AppError::ConfigError(
                "看门狗超时和检查间隔必须大于0".to_string(),
            ));
        }

        if self.websocket.channel_capacity == 0 {
            return Err(AppError::ConfigError(
                "事件通道容量必须大于0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> UploaderConfig {
        UploaderConfig {
            dataset: "crypto".to_string(),
            markets: MarketsConfig {
                spot_symbols: vec!["BTCUSDT".to_string()],
                perp_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                spot_intervals: vec!["1h".to_string()],
                perp_intervals: vec!["1h".to_string(), "5m".to_string()],
            },
            database: DatabaseConfig::default(),
            api: ApiConfig {
                spot_url: "https://api.binance.com".to_string(),
                perp_url: "https://fapi.binance.com".to_string(),
            },
            websocket: WebSocketConfig {
                spot_url: "wss://stream.binance.com:9443".to_string(),
                perp_url: "wss://fstream.binance.com".to_string(),
                channel_capacity: default_channel_capacity(),
            },
            backfill: BackfillConfig::default(),
            uploader: UploadTuningConfig::default(),
            watchdog: WatchdogConfig::default(),
            logging: LoggingConfig {
                log_level: "info".to_string(),
                log_dir: None,
                enable_console_output: true,
            },
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_interval() {
        let mut config = sample_config();
        config.markets.perp_intervals.push("abc".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_page() {
        let mut config = sample_config();
        config.backfill.page_size = 5000;
        assert!(config.validate().is_err());
    }
}

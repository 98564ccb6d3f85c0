use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};

/// 市场类型：现货或U本位永续合约
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Perp,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Perp => "perp",
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1分钟K线 - 流水线内部表示形式
///
/// open_time为对齐到桶边界的秒级时间戳（REST接口返回毫秒，入口处统一换算）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    /// K线开盘时间（秒）
    pub open_time: i64,
    /// 开盘价
    pub open: f64,
    /// 最高价
    pub high: f64,
    /// 最低价
    pub low: f64,
    /// 收盘价
    pub close: f64,
    /// 成交量
    pub volume: f64,
    /// 报价资产成交量
    pub quote_volume: f64,
    /// 成交笔数
    pub trade_count: i64,
    /// 主动买入基础资产成交量
    pub taker_buy_volume: f64,
    /// 主动买入报价资产成交量
    pub taker_buy_quote_volume: f64,
}

impl MinuteBar {
    /// 从REST K线接口的原始数组创建
    ///
    /// 原始格式: [open_time_ms, open, high, low, close, volume,
    ///            close_time_ms, quote_volume, trades, taker_buy_volume,
    ///            taker_buy_quote_volume, ignore]
    /// close_time和ignore字段在本系统中没有用处，直接丢弃
    pub fn from_rest_row(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 12 {
            return None;
        }

        fn as_f64(v: &serde_json::Value) -> Option<f64> {
            v.as_str()?.parse::<f64>().ok()
        }

        Some(Self {
            open_time: raw[0].as_i64()? / 1000,
            open: as_f64(&raw[1])?,
            high: as_f64(&raw[2])?,
            low: as_f64(&raw[3])?,
            close: as_f64(&raw[4])?,
            volume: as_f64(&raw[5])?,
            quote_volume: as_f64(&raw[7])?,
            trade_count: raw[8].as_i64()?,
            taker_buy_volume: as_f64(&raw[9])?,
            taker_buy_quote_volume: as_f64(&raw[10])?,
        })
    }

    /// 计算该K线所属的聚合桶时间戳
    pub fn bucket(&self, interval_secs: i64) -> i64 {
        (self.open_time / interval_secs) * interval_secs
    }
}

/// K线数据结构（WebSocket推送格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsKlinePayload {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "T")]
    pub end_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "n")]
    pub trade_count: i64,
    #[serde(rename = "x")]
    pub is_closed: bool,
    #[serde(rename = "q")]
    pub quote_volume: String,
    #[serde(rename = "V")]
    pub taker_buy_volume: String,
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: String,
}

impl WsKlinePayload {
    /// 转换为内部1分钟K线格式
    ///
    /// WebSocket推送的价格是字符串，任何一个字段解析失败都视为数据故障
    pub fn to_minute_bar(&self) -> Result<MinuteBar> {
        fn parse(field: &str, value: &str) -> Result<f64> {
            value.parse::<f64>().map_err(|e| {
                AppError::ParseError(format!("kline字段 {} 解析失败: {} - {}", field, value, e))
            })
        }

        Ok(MinuteBar {
            open_time: self.start_time / 1000,
            open: parse("o", &self.open)?,
            high: parse("h", &self.high)?,
            low: parse("l", &self.low)?,
            close: parse("c", &self.close)?,
            volume: parse("v", &self.volume)?,
            quote_volume: parse("q", &self.quote_volume)?,
            trade_count: self.trade_count,
            taker_buy_volume: parse("V", &self.taker_buy_volume)?,
            taker_buy_quote_volume: parse("Q", &self.taker_buy_quote_volume)?,
        })
    }
}

/// WebSocket kline事件外层结构
#[derive(Debug, Clone, Deserialize)]
pub struct WsKlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: WsKlinePayload,
}

/// 聚合行 - 一个目标周期桶的OHLCV加派生统计量
///
/// 字段布局与分析库中目标表的列一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggRow {
    pub symbol: String,
    /// 桶开始时间（秒，已对齐到周期边界）
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: i64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    /// 桶内1分钟收盘价均值
    pub twap: f64,
    /// 按5分钟子窗口最后收盘价计算的均值，仅在周期大于5分钟时存在
    pub twap_5m: Option<f64>,
    /// 收盘价总体标准差（波动率代理）
    pub close_std: f64,
    /// 相邻收盘价差分的总体标准差，首根K线的"前收盘"取其自身开盘价
    pub close_diff_std: f64,
    /// 最高价均值（滑点代理）
    pub high_mean: f64,
    /// 最低价均值（滑点代理）
    pub low_mean: f64,
    /// (high - open)均值
    pub high_open_mean: f64,
    /// (low - open)均值
    pub low_open_mean: f64,
    /// ln(high/low)均值（微观结构代理）
    pub ln_hl_mean: f64,
    /// ln(high/low)平方的均值
    pub ln_hl_sq_mean: f64,
}

impl AggRow {
    /// 检查所有派生字段是否都是有限数
    ///
    /// 任何字段非有限的桶会被整体丢弃而不是带着残缺数据入库
    pub fn is_finite(&self) -> bool {
        let mut values = vec![
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.quote_volume,
            self.taker_buy_volume,
            self.taker_buy_quote_volume,
            self.twap,
            self.close_std,
            self.close_diff_std,
            self.high_mean,
            self.low_mean,
            self.high_open_mean,
            self.low_open_mean,
            self.ln_hl_mean,
            self.ln_hl_sq_mean,
        ];
        if let Some(v) = self.twap_5m {
            values.push(v);
        }
        values.iter().all(|v| v.is_finite())
    }
}

/// 秒级桶时间转可读UTC时间，日志用
pub fn format_bucket(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// 构建目标表标识：dataset.table
///
/// 表名由市场类型和周期共同决定，沿用分析库中既有的命名：
/// 现货基表为binance_ohlcv_spot，合约基表为binance_ohlcv，
/// 1h写入基表，其他周期追加_{interval}后缀
pub fn destination_id(dataset: &str, market: MarketType, interval: &str) -> String {
    let base = match market {
        MarketType::Spot => "binance_ohlcv_spot",
        MarketType::Perp => "binance_ohlcv",
    };
    if interval == "1h" {
        format!("{}.{}", dataset, base)
    } else {
        format!("{}.{}_{}", dataset, base, interval)
    }
}

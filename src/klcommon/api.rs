use crate::klcommon::{AppError, MarketType, MinuteBar, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 将时间间隔转换为秒数
/// 例如: "1m" -> 60, "5m" -> 300, "1h" -> 3600
///
/// 无法识别的周期返回0，调用方以此判定配置非法
pub fn interval_to_seconds(interval: &str) -> i64 {
    if interval.len() < 2 {
        return 0;
    }
    let last_char = interval.chars().last().unwrap_or('m');
    let value: i64 = match interval[..interval.len() - 1].parse() {
        Ok(v) if v > 0 => v,
        _ => return 0,
    };

    match last_char {
        'm' => value * 60,
        'h' => value * 60 * 60,
        'd' => value * 24 * 60 * 60,
        'w' => value * 7 * 24 * 60 * 60,
        _ => 0,
    }
}

/// 历史K线源接口
///
/// 核心流水线通过它做补齐，与存储接口一样留出可替换的缝
#[async_trait]
pub trait HistoricalFeed: Send + Sync {
    /// 拉取一页1分钟K线
    ///
    /// start_time_ms为页起点（毫秒，含）；返回空向量表示该起点之后没有数据，
    /// 补齐流程以空页作为结束条件
    async fn fetch_1m_page(
        &self,
        market: MarketType,
        symbol: &str,
        start_time_ms: i64,
        limit: usize,
    ) -> Result<Vec<MinuteBar>>;
}

/// 币安REST客户端 - 仅用于1分钟K线的历史补齐
#[derive(Clone, Debug)]
pub struct BinanceApi {
    spot_url: String,
    perp_url: String,
}

impl BinanceApi {
    pub fn new(spot_url: String, perp_url: String) -> Self {
        Self { spot_url, perp_url }
    }

    /// 创建一个新的HTTP客户端实例（每次请求都会创建新的连接）
    fn create_client(&self) -> Result<Client> {
        // 带超时设置并禁用连接池，补齐请求频率低，连接复用不值得
        Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(0)
            .pool_idle_timeout(Duration::from_secs(0))
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))
    }
}

/// 截取前max_chars个字符，避免在多字节字符中间切断
fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl HistoricalFeed for BinanceApi {
    async fn fetch_1m_page(
        &self,
        market: MarketType,
        symbol: &str,
        start_time_ms: i64,
        limit: usize,
    ) -> Result<Vec<MinuteBar>> {
        let url = match market {
            MarketType::Spot => format!(
                "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&limit={}",
                self.spot_url, symbol, start_time_ms, limit
            ),
            MarketType::Perp => format!(
                "{}/fapi/v1/klines?symbol={}&interval=1m&startTime={}&limit={}",
                self.perp_url, symbol, start_time_ms, limit
            ),
        };

        let client = self.create_client()?;
        debug!(target: "api", "发送K线分页请求: {}", url);

        let response = match client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(target: "api", "{}/{}: K线分页请求失败: URL={}, 错误: {}", market, symbol, url, e);
                return Err(AppError::from(e));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            let api_error = AppError::ApiError(format!(
                "下载 {} 的1分钟K线失败: {} - {}",
                symbol, status, text
            ));
            error!(target: "api", "下载 {} 的1分钟K线失败: {} - {}", symbol, status, text);
            return Err(api_error);
        }

        let response_text = response.text().await?;
        let raw_klines: Vec<Vec<Value>> = match serde_json::from_str(&response_text) {
            Ok(data) => data,
            Err(e) => {
                error!(target: "api", "{}/{}: 解析K线JSON失败: {}, 响应前1000个字符: {}",
                    market, symbol, e, preview(&response_text, 1000));
                return Err(AppError::JsonError(e));
            }
        };

        let bars = raw_klines
            .iter()
            .filter_map(|raw| MinuteBar::from_rest_row(raw))
            .collect::<Vec<MinuteBar>>();

        if bars.len() != raw_klines.len() {
            warn!(target: "api",
                "解析 {} 的部分K线失败: 解析了 {}/{} 条",
                symbol, bars.len(), raw_klines.len());
        }

        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_to_seconds() {
        assert_eq!(interval_to_seconds("1m"), 60);
        assert_eq!(interval_to_seconds("5m"), 300);
        assert_eq!(interval_to_seconds("1h"), 3600);
        assert_eq!(interval_to_seconds("4h"), 14400);
        assert_eq!(interval_to_seconds("1d"), 86400);
        assert_eq!(interval_to_seconds("1w"), 604800);
    }

    #[test]
    fn test_interval_to_seconds_invalid() {
        assert_eq!(interval_to_seconds(""), 0);
        assert_eq!(interval_to_seconds("m"), 0);
        assert_eq!(interval_to_seconds("abc"), 0);
        assert_eq!(interval_to_seconds("0m"), 0);
        assert_eq!(interval_to_seconds("-5m"), 0);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("abcdef", 4), "abcd");
        assert_eq!(preview("abc", 1000), "abc");
        // 多字节字符不能被切到一半
        assert_eq!(preview("价格解析失败", 2), "价格");
        assert_eq!(preview("", 10), "");
    }
}

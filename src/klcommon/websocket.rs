//! WebSocket行情接入层
//!
//! 每个市场一条组合流连接，订阅全部品种的kline_1m流，把推送逐条解析成
//! FeedEvent后塞进有序的mpsc通道。核心流水线只消费通道，不关心传输层的
//! 线程模型。断线不在这一层重连：连接错误作为终端事件上报，整个进程
//! 交给外部supervisor重启（依赖水位线播种恢复，不会丢数据）。

use crate::klcommon::models::{MarketType, MinuteBar, WsKlineEvent};
use crate::klcommon::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// 行情事件，按到达顺序投递给单一消费者
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// 一条1分钟K线更新（可能是未收盘的部分K线）
    Kline {
        market: MarketType,
        symbol: String,
        is_closed: bool,
        bar: MinuteBar,
    },
    /// 传输层错误，对整个流水线是终端事件
    Error(String),
    /// 其他消息（订阅确认等），消费侧忽略
    Other,
}

/// 组合流消息外层：{"stream": "...", "data": {...}}
#[derive(Deserialize)]
struct CombinedStreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

/// 单个市场的kline_1m订阅
pub struct KlineFeed {
    market: MarketType,
    ws_url: String,
    symbols: Vec<String>,
}

impl KlineFeed {
    pub fn new(market: MarketType, ws_url: String, symbols: Vec<String>) -> Self {
        Self {
            market,
            ws_url,
            symbols,
        }
    }

    /// 组合流URL，形如 wss://.../stream?streams=btcusdt@kline_1m/ethusdt@kline_1m
    fn stream_url(&self) -> String {
        let streams = self
            .symbols
            .iter()
            .map(|s| format!("{}@kline_1m", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={}", self.ws_url, streams)
    }

    /// 连接并持续读取，直到连接结束或消费端关闭
    ///
    /// 任何传输错误都转成FeedEvent::Error后返回，不重连
    pub async fn run(self, tx: mpsc::Sender<FeedEvent>) {
        let url = match url::Url::parse(&self.stream_url()) {
            Ok(url) => url,
            Err(e) => {
                error!(target: "websocket", "{}: 流URL非法: {}", self.market, e);
                let _ = tx
                    .send(FeedEvent::Error(format!("{}: 流URL非法: {}", self.market, e)))
                    .await;
                return;
            }
        };
        info!(target: "websocket", "{}: 连接组合流, 品种数: {}", self.market, self.symbols.len());

        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(target: "websocket", "{}: 连接失败: {}", self.market, e);
                let _ = tx
                    .send(FeedEvent::Error(format!("{}: 连接失败: {}", self.market, e)))
                    .await;
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let event = self.parse_message(&text);
                    let is_error = matches!(event, FeedEvent::Error(_));
                    if tx.send(event).await.is_err() {
                        debug!(target: "websocket", "{}: 消费端已关闭，停止读取", self.market);
                        return;
                    }
                    if is_error {
                        return;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        error!(target: "websocket", "{}: 回复pong失败: {}", self.market, e);
                        let _ = tx
                            .send(FeedEvent::Error(format!("{}: 回复pong失败: {}", self.market, e)))
                            .await;
                        return;
                    }
                }
                Ok(Message::Close(frame)) => {
                    warn!(target: "websocket", "{}: 服务端关闭连接: {:?}", self.market, frame);
                    let _ = tx
                        .send(FeedEvent::Error(format!("{}: 连接被服务端关闭", self.market)))
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(target: "websocket", "{}: 读取消息失败: {}", self.market, e);
                    let _ = tx
                        .send(FeedEvent::Error(format!("{}: 读取消息失败: {}", self.market, e)))
                        .await;
                    return;
                }
            }
        }

        // 流自然结束同样视为终端事件
        warn!(target: "websocket", "{}: 消息流结束", self.market);
        let _ = tx
            .send(FeedEvent::Error(format!("{}: 消息流结束", self.market)))
            .await;
    }

    /// 把一条文本帧解析成FeedEvent
    fn parse_message(&self, text: &str) -> FeedEvent {
        let envelope: CombinedStreamMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                // 组合流端点只会推送带stream字段的消息，解析不了说明协议对不上
                warn!(target: "websocket", "{}: 无法解析组合流消息: {}", self.market, e);
                return FeedEvent::Other;
            }
        };

        if envelope.data.get("e").and_then(|v| v.as_str()) != Some("kline") {
            return FeedEvent::Other;
        }

        let event: WsKlineEvent = match serde_json::from_value(envelope.data) {
            Ok(ev) => ev,
            Err(e) => {
                return FeedEvent::Error(format!("{}: kline事件解析失败: {}", self.market, e))
            }
        };

        match event.kline.to_minute_bar() {
            Ok(bar) => FeedEvent::Kline {
                market: self.market,
                symbol: event.symbol,
                is_closed: event.kline.is_closed,
                bar,
            },
            Err(e) => FeedEvent::Error(format!("{}: {}", self.market, e)),
        }
    }
}

//! 接入与调度
//!
//! 每个市场一个[`MarketIngestor`]：维护各品种的1分钟缓冲和水位线，
//! 负责启动时的历史补齐和实时K线的入缓冲，每次数据变化后跑一遍
//! 聚合→放行→入队→推进→裁剪的同步流水线。
//!
//! [`IngestService`]是唯一的事件消费者：WebSocket任务只往通道里塞
//! [`FeedEvent`]，所有状态变更都在这一个任务里串行完成，不需要锁。

use super::aggregator::aggregate;
use super::buffer::MinuteBuffer;
use super::uploader::BatchingUploader;
use super::watermark::WatermarkTracker;
use crate::klcommon::{
    destination_id, format_bucket, interval_to_seconds, AnalyticalStore, AppError, FeedEvent,
    HistoricalFeed, MarketType, MinuteBar, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// 单个市场的接入器
pub struct MarketIngestor {
    market: MarketType,
    dataset: String,
    symbols: Vec<String>,
    /// (周期名, 周期秒数)，构造时解析完毕
    intervals: Vec<(String, i64)>,
    buffers: HashMap<String, MinuteBuffer>,
    watermarks: WatermarkTracker,
    backfilled: HashSet<String>,
    api: Arc<dyn HistoricalFeed>,
    store: Arc<dyn AnalyticalStore>,
    uploader: Arc<BatchingUploader>,
    page_size: usize,
}

impl MarketIngestor {
    pub fn new(
        market: MarketType,
        dataset: String,
        symbols: Vec<String>,
        intervals: &[String],
        api: Arc<dyn HistoricalFeed>,
        store: Arc<dyn AnalyticalStore>,
        uploader: Arc<BatchingUploader>,
        page_size: usize,
    ) -> Self {
        let intervals = intervals
            .iter()
            .map(|i| (i.clone(), interval_to_seconds(i)))
            .collect();
        // 启动阶段为每个配置品种建好缓冲，处理更新时不做隐式创建
        let buffers = symbols
            .iter()
            .map(|s| (s.clone(), MinuteBuffer::new()))
            .collect();
        Self {
            market,
            dataset,
            symbols,
            intervals,
            buffers,
            watermarks: WatermarkTracker::new(),
            backfilled: HashSet::new(),
            api,
            store,
            uploader,
            page_size,
        }
    }

    pub fn market(&self) -> MarketType {
        self.market
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// 从存储端已有数据初始化所有(周期, 品种)的水位线
    ///
    /// 存储端没有数据的键保持未初始化（水位线0），从头补齐
    pub async fn seed_watermarks(&mut self) -> Result<()> {
        for (interval, _) in &self.intervals {
            let destination = destination_id(&self.dataset, self.market, interval);
            for symbol in &self.symbols {
                if let Some(open_time) = self.store.max_open_time(&destination, symbol).await? {
                    self.watermarks.seed(interval, symbol, open_time);
                    info!(
                        target: "ingestor",
                        "水位线初始化: {} {} {} -> {}",
                        self.market, interval, symbol, format_bucket(open_time)
                    );
                }
            }
        }
        Ok(())
    }

    /// 对所有配置的品种做一轮历史补齐
    ///
    /// 这一轮不把品种标记为已追平：初始补齐到连上行情之间还会产生新K线，
    /// 由每个品种的首条实时K线再触发一次追平补齐来封住这个窗口
    pub async fn backfill_all(&mut self) -> Result<()> {
        let symbols = self.symbols.clone();
        for symbol in symbols {
            self.backfill_symbol(&symbol).await?;
        }
        Ok(())
    }

    /// 从最落后周期的水位线开始分页拉取1分钟K线
    ///
    /// 每拉一页立刻跑一遍流水线，长补齐过程中已收盘的桶边拉边入队，
    /// 不等全部历史就绪
    async fn backfill_symbol(&mut self, symbol: &str) -> Result<()> {
        let interval_names: Vec<String> =
            self.intervals.iter().map(|(name, _)| name.clone()).collect();
        // 有水位线时从其后1秒继续，没有则从头拉
        let mut start_ms = match self.watermarks.min_watermark(symbol, &interval_names) {
            Some(mark) => (mark + 1) * 1000,
            None => 0,
        };
        let mut pages = 0usize;
        let mut total = 0usize;

        loop {
            let page = self
                .api
                .fetch_1m_page(self.market, symbol, start_ms, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            pages += 1;
            total += page.len();
            let short_page = page.len() < self.page_size;
            let last_open = page[page.len() - 1].open_time;

            self.buffers
                .entry(symbol.to_string())
                .or_default()
                .merge(page);
            self.run_pipeline(symbol);

            if short_page {
                // 不满页说明已经追到最新，下一页必然为空
                break;
            }
            start_ms = last_open * 1000 + 60_000;
        }

        info!(
            target: "ingestor",
            "历史补齐完成: {} {} 页数={} K线数={}",
            self.market, symbol, pages, total
        );
        Ok(())
    }

    /// 处理一根实时1分钟K线（未收盘的也进缓冲，后续同桶更新覆盖）
    pub async fn handle_update(&mut self, symbol: &str, bar: MinuteBar) -> Result<()> {
        // 首条实时K线先做一次追平补齐，把初始补齐之后、连上行情之前
        // 收盘的K线拉回来，否则中间的桶会带着缺口入库
        if !self.backfilled.contains(symbol) {
            info!(
                target: "ingestor",
                "品种 {} 收到首条实时K线，执行追平补齐", symbol
            );
            self.backfill_symbol(symbol).await?;
            self.backfilled.insert(symbol.to_string());
        }

        self.buffers
            .entry(symbol.to_string())
            .or_default()
            .merge(vec![bar]);
        self.run_pipeline(symbol);
        Ok(())
    }

    /// 同步流水线：聚合→放行→入队→推进水位线→裁剪缓冲
    fn run_pipeline(&mut self, symbol: &str) {
        let Some(buffer) = self.buffers.get(symbol) else {
            return;
        };
        let bars = buffer.bars().to_vec();

        for (interval, secs) in self.intervals.clone() {
            let rows = aggregate(symbol, &bars, secs);
            let admitted = self
                .watermarks
                .admit(&interval, symbol, rows, |r| r.open_time);
            if admitted.is_empty() {
                continue;
            }

            let newest = admitted
                .iter()
                .map(|r| r.open_time)
                .max()
                .unwrap_or(0);
            let destination = destination_id(&self.dataset, self.market, &interval);
            info!(
                target: "ingestor",
                "入队: {} {} 行数={} 最新桶={}",
                destination, symbol, admitted.len(), format_bucket(newest)
            );
            self.uploader.enqueue(&destination, admitted);
            // 入队即推进，失败重试由上传器负责，行不会二次入队
            self.watermarks.advance(&interval, symbol, newest);
        }

        let interval_names: Vec<String> =
            self.intervals.iter().map(|(name, _)| name.clone()).collect();
        if let Some(min_mark) = self.watermarks.min_watermark(symbol, &interval_names) {
            if let Some(buffer) = self.buffers.get_mut(symbol) {
                buffer.trim(min_mark);
            }
        }
    }
}

/// 统一事件消费服务
pub struct IngestService {
    ingestors: Vec<MarketIngestor>,
    ping: Arc<dyn Fn() + Send + Sync>,
}

impl IngestService {
    pub fn new(ingestors: Vec<MarketIngestor>, ping: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self { ingestors, ping }
    }

    /// 启动准备：初始化水位线并做一轮全量补齐
    pub async fn init(&mut self) -> Result<()> {
        for ingestor in &mut self.ingestors {
            ingestor.seed_watermarks().await?;
            ingestor.backfill_all().await?;
        }
        Ok(())
    }

    /// 消费实时事件直到流水线终结
    ///
    /// 三种终结方式都返回：行情流上报错误、处理实时K线失败、
    /// 所有生产者关闭通道。前两种返回Err，交给上层决定退出码。
    pub async fn run(&mut self, mut rx: mpsc::Receiver<FeedEvent>) -> Result<()> {
        while let Some(event) = rx.recv().await {
            match event {
                FeedEvent::Kline {
                    market,
                    symbol,
                    is_closed: _,
                    bar,
                } => {
                    let Some(ingestor) = self
                        .ingestors
                        .iter_mut()
                        .find(|i| i.market() == market)
                    else {
                        continue;
                    };
                    if let Err(e) = ingestor.handle_update(&symbol, bar).await {
                        error!(
                            target: "ingestor",
                            "处理实时K线失败: {} {} {}，流水线终结",
                            market, symbol, e
                        );
                        return Err(e);
                    }
                    (self.ping)();
                }
                FeedEvent::Error(reason) => {
                    error!(target: "ingestor", "行情流错误: {}，流水线终结", reason);
                    return Err(AppError::WebSocketError(reason));
                }
                FeedEvent::Other => {}
            }
        }
        info!(target: "ingestor", "事件通道关闭，流水线终结");
        Ok(())
    }
}

// K线聚合上传服务主程序
use clap::Parser;
use kline_uploader::klcommon::{
    init_logging, AnalyticalStore, BinanceApi, Database, KlineFeed, MarketType, UploaderConfig,
    Watchdog,
};
use kline_uploader::klupload::{BatchingUploader, IngestService, MarketIngestor};
use kline_uploader::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kline_upload_service")]
#[command(about = "币安K线聚合上传服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/KlineUploaderConfig.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 加载配置（from_file内部已校验）
    let config = UploaderConfig::from_file(&args.config)?;

    // 初始化日志，guard持有到进程退出
    let _log_guard = init_logging(&config.logging)?;
    info!(target: "server", "启动K线聚合上传服务, 配置文件: {}", args.config);

    // 分析存储
    let database = Arc::new(Database::new(&config.database)?);
    let store: Arc<dyn AnalyticalStore> = database;

    // 看门狗：上传器和接入器两个组件，任何一个长时间无进展就退出进程
    let watchdog = Watchdog::new();
    let start_grace = Duration::from_secs(config.watchdog.start_grace_secs);
    let timeout = Duration::from_secs(config.watchdog.timeout_secs);
    watchdog.register("uploader", start_grace, timeout);
    watchdog.register("ingestor", start_grace, timeout);
    let watchdog_handle =
        watchdog.spawn_check_loop(Duration::from_secs(config.watchdog.check_interval_secs));

    // 批量上传器先启动，补齐期间产出的行直接入队
    let uploader_ping = {
        let watchdog = watchdog.clone();
        Arc::new(move || watchdog.ping("uploader")) as Arc<dyn Fn() + Send + Sync>
    };
    let uploader = Arc::new(BatchingUploader::start(
        store.clone(),
        Duration::from_secs(config.uploader.retry_delay_secs),
        Duration::from_secs(config.uploader.idle_delay_secs),
        uploader_ping,
    ));

    let api = Arc::new(BinanceApi::new(
        config.api.spot_url.clone(),
        config.api.perp_url.clone(),
    ));

    let mut ingestors = Vec::new();
    if !config.markets.spot_symbols.is_empty() {
        ingestors.push(MarketIngestor::new(
            MarketType::Spot,
            config.dataset.clone(),
            config.markets.spot_symbols.clone(),
            &config.markets.spot_intervals,
            api.clone(),
            store.clone(),
            uploader.clone(),
            config.backfill.page_size,
        ));
    }
    if !config.markets.perp_symbols.is_empty() {
        ingestors.push(MarketIngestor::new(
            MarketType::Perp,
            config.dataset.clone(),
            config.markets.perp_symbols.clone(),
            &config.markets.perp_intervals,
            api.clone(),
            store.clone(),
            uploader.clone(),
            config.backfill.page_size,
        ));
    }

    let ingest_ping = {
        let watchdog = watchdog.clone();
        Arc::new(move || watchdog.ping("ingestor")) as Arc<dyn Fn() + Send + Sync>
    };
    let mut service = IngestService::new(ingestors, ingest_ping);

    // 先播种水位线并做初始补齐再接实时流；每个品种的首条实时K线
    // 会再触发一次追平补齐，封住初始补齐与连上行情之间的窗口
    info!(target: "server", "开始水位线播种与历史补齐");
    service.init().await?;
    info!(target: "server", "历史补齐完成，接入实时行情");

    let (tx, rx) = mpsc::channel(config.websocket.channel_capacity);
    if !config.markets.spot_symbols.is_empty() {
        let feed = KlineFeed::new(
            MarketType::Spot,
            config.websocket.spot_url.clone(),
            config.markets.spot_symbols.clone(),
        );
        let tx = tx.clone();
        tokio::spawn(async move { feed.run(tx).await });
    }
    if !config.markets.perp_symbols.is_empty() {
        let feed = KlineFeed::new(
            MarketType::Perp,
            config.websocket.perp_url.clone(),
            config.markets.perp_symbols.clone(),
        );
        let tx = tx.clone();
        tokio::spawn(async move { feed.run(tx).await });
    }
    drop(tx);

    // 消费到流水线终结为止：行情流断开即终结，由外部supervisor重启进程
    let pipeline_result = service.run(rx).await;
    match &pipeline_result {
        Ok(()) => info!(target: "server", "流水线正常终结，开始排空上传队列"),
        Err(e) => error!(target: "server", "流水线异常终结: {}，开始排空上传队列", e),
    }

    // 有序停机：先排空已入队的行，再退出
    uploader.shutdown();
    uploader.join().await;
    watchdog_handle.abort();
    info!(target: "server", "上传队列已排空，服务退出");

    pipeline_result
}

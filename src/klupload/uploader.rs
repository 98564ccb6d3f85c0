//! 批量上传器
//!
//! 单个后台任务轮询所有目标表的队列，每轮选积压批次最多的目标，
//! 把它的全部积压快照成一次写入。写入成功才裁剪队列前缀；
//! 失败则固定间隔后重试，队列原样保留，依赖存储端按
//! (symbol, open_time)幂等去重。

use crate::klcommon::{AggRow, AnalyticalStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type QueueMap = HashMap<String, Vec<Vec<AggRow>>>;

/// 选出积压批次最多的目标，空队列不参与
pub(crate) fn select_largest(queues: &QueueMap) -> Option<String> {
    queues
        .iter()
        .filter(|(_, batches)| !batches.is_empty())
        .max_by_key(|(_, batches)| batches.len())
        .map(|(dest, _)| dest.clone())
}

pub struct BatchingUploader {
    queues: Arc<Mutex<QueueMap>>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingUploader {
    /// 启动后台上传循环
    ///
    /// ping在每次成功写入后调用，喂看门狗
    pub fn start(
        store: Arc<dyn AnalyticalStore>,
        retry_delay: Duration,
        idle_delay: Duration,
        ping: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let queues: Arc<Mutex<QueueMap>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_queues = queues.clone();
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            upload_loop(loop_queues, loop_shutdown, store, retry_delay, idle_delay, ping).await;
        });

        Self {
            queues,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// 入队一批行，立即返回
    pub fn enqueue(&self, destination: &str, rows: Vec<AggRow>) {
        if rows.is_empty() {
            return;
        }
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(destination.to_string())
            .or_default()
            .push(rows);
    }

    /// 请求停机：排空现有积压后上传循环退出
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// 等待上传循环退出，重复调用直接返回
    pub async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(target: "uploader", "上传任务异常退出: {}", e);
            }
        }
    }
}

async fn upload_loop(
    queues: Arc<Mutex<QueueMap>>,
    shutdown: Arc<AtomicBool>,
    store: Arc<dyn AnalyticalStore>,
    retry_delay: Duration,
    idle_delay: Duration,
    ping: Arc<dyn Fn() + Send + Sync>,
) {
    info!(target: "uploader", "上传循环启动");
    loop {
        // 快照在锁内完成，写入在锁外进行
        let target = {
            let queues = queues.lock().unwrap();
            select_largest(&queues).map(|dest| {
                let batches = &queues[&dest];
                let rows: Vec<AggRow> = batches.iter().flatten().cloned().collect();
                (dest, batches.len(), rows)
            })
        };

        let Some((destination, batch_count, rows)) = target else {
            if shutdown.load(Ordering::SeqCst) {
                info!(target: "uploader", "积压已排空，上传循环退出");
                return;
            }
            tokio::time::sleep(idle_delay).await;
            continue;
        };

        match store.append(&destination, &rows).await {
            Ok(()) => {
                info!(
                    target: "uploader",
                    "写入成功: {} 行数={} 批次={}",
                    destination,
                    rows.len(),
                    batch_count
                );
                // 只裁剪快照覆盖的前缀，写入期间新入队的批次保留
                let mut queues = queues.lock().unwrap();
                if let Some(batches) = queues.get_mut(&destination) {
                    batches.drain(..batch_count.min(batches.len()));
                }
                ping();
            }
            Err(e) => {
                warn!(
                    target: "uploader",
                    "写入失败: {} 行数={} 错误={}，{}秒后重试",
                    destination,
                    rows.len(),
                    e,
                    retry_delay.as_secs()
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn row(symbol: &str, open_time: i64) -> AggRow {
        AggRow {
            symbol: symbol.to_string(),
            open_time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            quote_volume: 15.0,
            trade_count: 3,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 7.5,
            twap: 1.5,
            twap_5m: None,
            close_std: 0.0,
            close_diff_std: 0.0,
            high_mean: 2.0,
            low_mean: 0.5,
            high_open_mean: 1.0,
            low_open_mean: -0.5,
            ln_hl_mean: 1.0,
            ln_hl_sq_mean: 1.0,
        }
    }

    fn batch(dest_rows: usize) -> Vec<Vec<AggRow>> {
        (0..dest_rows).map(|i| vec![row("X", i as i64 * 60)]).collect()
    }

    #[test]
    fn test_select_largest_queue() {
        let mut queues = QueueMap::new();
        queues.insert("a".to_string(), batch(3));
        queues.insert("b".to_string(), batch(7));
        queues.insert("c".to_string(), batch(1));
        assert_eq!(select_largest(&queues), Some("b".to_string()));
    }

    #[test]
    fn test_select_skips_empty_queues() {
        let mut queues = QueueMap::new();
        queues.insert("a".to_string(), Vec::new());
        assert_eq!(select_largest(&queues), None);
    }

    /// 前fail_times次写入失败，之后成功并记录行
    struct FlakyStore {
        fail_times: AtomicUsize,
        written: Mutex<Vec<(String, Vec<AggRow>)>>,
    }

    #[async_trait]
    impl AnalyticalStore for FlakyStore {
        async fn max_open_time(&self, _destination: &str, _symbol: &str) -> Result<Option<i64>> {
            Ok(None)
        }

        async fn append(&self, destination: &str, rows: &[AggRow]) -> Result<()> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(crate::klcommon::AppError::DatabaseError(
                    "模拟写入失败".to_string(),
                ));
            }
            self.written
                .lock()
                .unwrap()
                .push((destination.to_string(), rows.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drains_backlog_then_exits_on_shutdown() {
        let store = Arc::new(FlakyStore {
            fail_times: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
        });
        let pings = Arc::new(AtomicUsize::new(0));
        let ping_count = pings.clone();

        let uploader = BatchingUploader::start(
            store.clone(),
            Duration::from_millis(5),
            Duration::from_millis(5),
            Arc::new(move || {
                ping_count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        uploader.enqueue("ds.binance_ohlcv", vec![row("BTCUSDT", 0)]);
        uploader.enqueue("ds.binance_ohlcv", vec![row("BTCUSDT", 3600)]);
        uploader.enqueue("ds.binance_ohlcv_5m", vec![row("BTCUSDT", 300)]);

        uploader.shutdown();
        uploader.join().await;

        let written = store.written.lock().unwrap();
        let total: usize = written.iter().map(|(_, rows)| rows.len()).sum();
        assert_eq!(total, 3);
        assert!(pings.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_retry_after_write_failure_keeps_rows() {
        let store = Arc::new(FlakyStore {
            fail_times: AtomicUsize::new(2),
            written: Mutex::new(Vec::new()),
        });

        let uploader = BatchingUploader::start(
            store.clone(),
            Duration::from_millis(2),
            Duration::from_millis(2),
            Arc::new(|| {}),
        );

        uploader.enqueue("ds.binance_ohlcv", vec![row("BTCUSDT", 0), row("BTCUSDT", 3600)]);
        uploader.shutdown();
        uploader.join().await;

        // 两次失败不丢行，第三次全量写入
        let written = store.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1.len(), 2);
    }
}

//! 分析库访问层
//!
//! 核心流水线只依赖`AnalyticalStore`接口；生产实现基于SQLite连接池，
//! 每个目标（destination）一张表，主键(symbol, open_time)，
//! 重复投递通过INSERT OR REPLACE收敛为幂等写入

use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::AggRow;
use crate::klcommon::DatabaseConfig;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

/// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 分析库接口
///
/// append必须能安全接受重复/重叠的行（库侧身份键为(symbol, open_time)）
#[async_trait]
pub trait AnalyticalStore: Send + Sync {
    /// 查询某目标中某品种已持久化的最大open_time，表不存在或无数据返回None
    async fn max_open_time(&self, destination: &str, symbol: &str) -> Result<Option<i64>>;

    /// 追加一批聚合行，任何失败返回传输错误
    async fn append(&self, destination: &str, rows: &[AggRow]) -> Result<()>;
}

/// SQLite实现的分析库
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// 创建数据库实例并初始化连接池
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let path = Path::new(&config.database_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)?;

        if config.enable_wal {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        }

        info!(target: "db", "数据库初始化完成: {}", config.database_path);
        Ok(Self { pool })
    }

    /// 目标标识转为合法的SQLite表名
    ///
    /// 目标形如dataset.table，点号在SQLite中会被当作库名限定符，统一检查后原样
    /// 引号包裹使用；只允许字母数字、下划线和点，杜绝拼接出意外SQL
    fn table_name(destination: &str) -> Result<String> {
        let valid = !destination.is_empty()
            && destination
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(AppError::DatabaseError(format!(
                "非法的目标标识: {}",
                destination
            )));
        }
        Ok(format!("\"{}\"", destination))
    }

    /// 确保目标表存在
    fn ensure_table(conn: &rusqlite::Connection, table: &str) -> Result<()> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    symbol TEXT NOT NULL,
                    open_time INTEGER NOT NULL,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume REAL NOT NULL,
                    quote_volume REAL NOT NULL,
                    trade_count INTEGER NOT NULL,
                    taker_buy_volume REAL NOT NULL,
                    taker_buy_quote_volume REAL NOT NULL,
                    twap REAL NOT NULL,
                    twap_5m REAL,
                    close_std REAL NOT NULL,
                    close_diff_std REAL NOT NULL,
                    high_mean REAL NOT NULL,
                    low_mean REAL NOT NULL,
                    high_open_mean REAL NOT NULL,
                    low_open_mean REAL NOT NULL,
                    ln_hl_mean REAL NOT NULL,
                    ln_hl_sq_mean REAL NOT NULL,
                    PRIMARY KEY (symbol, open_time)
                )",
                table
            ),
            [],
        )?;
        Ok(())
    }

    fn append_blocking(pool: &DbPool, destination: &str, rows: &[AggRow]) -> Result<usize> {
        let table = Self::table_name(destination)?;
        let mut conn = pool.get()?;
        Self::ensure_table(&conn, &table)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (
                    symbol, open_time, open, high, low, close,
                    volume, quote_volume, trade_count,
                    taker_buy_volume, taker_buy_quote_volume,
                    twap, twap_5m, close_std, close_diff_std,
                    high_mean, low_mean, high_open_mean, low_open_mean,
                    ln_hl_mean, ln_hl_sq_mean
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                          ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                table
            ))?;

            for row in rows {
                stmt.execute(params![
                    row.symbol,
                    row.open_time,
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.volume,
                    row.quote_volume,
                    row.trade_count,
                    row.taker_buy_volume,
                    row.taker_buy_quote_volume,
                    row.twap,
                    row.twap_5m,
                    row.close_std,
                    row.close_diff_std,
                    row.high_mean,
                    row.low_mean,
                    row.high_open_mean,
                    row.low_open_mean,
                    row.ln_hl_mean,
                    row.ln_hl_sq_mean,
                ])?;
            }
        }
        tx.commit()?;

        Ok(rows.len())
    }

    fn max_open_time_blocking(
        pool: &DbPool,
        destination: &str,
        symbol: &str,
    ) -> Result<Option<i64>> {
        let table = Self::table_name(destination)?;
        let conn = pool.get()?;
        Self::ensure_table(&conn, &table)?;

        let result: Option<i64> = conn
            .query_row(
                &format!("SELECT MAX(open_time) FROM {} WHERE symbol = ?1", table),
                params![symbol],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        Ok(result)
    }
}

#[async_trait]
impl AnalyticalStore for Database {
    async fn max_open_time(&self, destination: &str, symbol: &str) -> Result<Option<i64>> {
        let pool = self.pool.clone();
        let destination = destination.to_string();
        let symbol = symbol.to_string();

        task::spawn_blocking(move || Self::max_open_time_blocking(&pool, &destination, &symbol))
            .await
            .map_err(|e| AppError::DatabaseError(format!("查询任务失败: {}", e)))?
    }

    async fn append(&self, destination: &str, rows: &[AggRow]) -> Result<()> {
        let pool = self.pool.clone();
        let destination = destination.to_string();
        let rows = rows.to_vec();

        let count =
            task::spawn_blocking(move || Self::append_blocking(&pool, &destination, &rows))
                .await
                .map_err(|e| AppError::DatabaseError(format!("写入任务失败: {}", e)))??;

        debug!(target: "db", "追加写入完成, 行数: {}", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(symbol: &str, open_time: i64, close: f64) -> AggRow {
        AggRow {
            symbol: symbol.to_string(),
            open_time,
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            quote_volume: 1000.0,
            trade_count: 5,
            taker_buy_volume: 4.0,
            taker_buy_quote_volume: 400.0,
            twap: close,
            twap_5m: None,
            close_std: 0.0,
            close_diff_std: 0.0,
            high_mean: close + 1.0,
            low_mean: close - 2.0,
            high_open_mean: 2.0,
            low_open_mean: -1.0,
            ln_hl_mean: 0.01,
            ln_hl_sq_mean: 0.0001,
        }
    }

    fn temp_db() -> Database {
        let path = std::env::temp_dir().join(format!(
            "kline_uploader_test_{}_{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        Database::new(&DatabaseConfig {
            database_path: path.to_string_lossy().to_string(),
            pool_size: 2,
            connection_timeout_secs: 5,
            enable_wal: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_max_open_time() {
        let db = temp_db();
        let dest = "crypto.binance_ohlcv";

        assert_eq!(db.max_open_time(dest, "X").await.unwrap(), None);

        let rows = vec![sample_row("X", 3600, 101.0), sample_row("X", 7200, 102.0)];
        db.append(dest, &rows).await.unwrap();
        assert_eq!(db.max_open_time(dest, "X").await.unwrap(), Some(7200));

        // 其他品种不受影响
        assert_eq!(db.max_open_time(dest, "Y").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_duplicate_rows_is_idempotent() {
        let db = temp_db();
        let dest = "crypto.binance_ohlcv_5m";

        let rows = vec![sample_row("X", 300, 50.0)];
        db.append(dest, &rows).await.unwrap();
        // 同一行重复投递，收敛为覆盖而不是报错
        let updated = vec![sample_row("X", 300, 51.0)];
        db.append(dest, &updated).await.unwrap();

        assert_eq!(db.max_open_time(dest, "X").await.unwrap(), Some(300));
    }

    #[test]
    fn test_table_name_rejects_injection() {
        assert!(Database::table_name("crypto.binance_ohlcv").is_ok());
        assert!(Database::table_name("x\"; DROP TABLE y; --").is_err());
        assert!(Database::table_name("").is_err());
    }
}

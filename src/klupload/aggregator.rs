//! 周期聚合器
//!
//! 纯函数：把1分钟序列折叠成目标周期的已收盘桶，并计算派生统计量。
//! 最新的（最大的）桶永远是未收盘的——后续还会有1分钟K线进来——
//! 因此无条件丢弃。含非有限派生值的桶整体丢弃，宁缺毋滥。

use crate::klcommon::{AggRow, MinuteBar};
use std::collections::HashMap;

/// 5分钟子窗口宽度（秒），twap_5m的分组粒度
const SUB_BUCKET_SECS: i64 = 300;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 总体标准差（ddof=0），空或单元素序列返回0
fn std_pop(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// 聚合1分钟序列为目标周期的已收盘行
///
/// bars必须按open_time升序且open_time唯一（缓冲区的不变量）。
/// 每个出现过的桶产出一行，最新桶除外。
pub fn aggregate(symbol: &str, bars: &[MinuteBar], interval_secs: i64) -> Vec<AggRow> {
    if bars.is_empty() || interval_secs <= 0 {
        return Vec::new();
    }

    let newest_bucket = bars.last().map(|b| b.bucket(interval_secs)).unwrap_or(0);

    // 周期跨多个5分钟窗口时才计算twap_5m：
    // 每个5分钟子窗口取最后一根的收盘价，再按目标桶求均值
    let twap_5m_by_bucket: Option<HashMap<i64, f64>> = if interval_secs > SUB_BUCKET_SECS {
        let mut last_close: Vec<(i64, f64)> = Vec::new();
        for bar in bars {
            let sub = bar.bucket(SUB_BUCKET_SECS);
            match last_close.last_mut() {
                Some((prev, close)) if *prev == sub => *close = bar.close,
                _ => last_close.push((sub, bar.close)),
            }
        }

        let mut sums: HashMap<i64, (f64, usize)> = HashMap::new();
        for (sub, close) in last_close {
            let bucket = (sub / interval_secs) * interval_secs;
            let entry = sums.entry(bucket).or_insert((0.0, 0));
            entry.0 += close;
            entry.1 += 1;
        }
        Some(
            sums.into_iter()
                .map(|(bucket, (sum, n))| (bucket, sum / n as f64))
                .collect(),
        )
    } else {
        None
    };

    let mut rows = Vec::new();
    let mut group: Vec<&MinuteBar> = Vec::new();
    let mut current_bucket = bars[0].bucket(interval_secs);

    for bar in bars {
        let bucket = bar.bucket(interval_secs);
        if bucket != current_bucket {
            if let Some(row) =
                aggregate_group(symbol, current_bucket, &group, twap_5m_by_bucket.as_ref())
            {
                rows.push(row);
            }
            group.clear();
            current_bucket = bucket;
        }
        group.push(bar);
    }

    // 末尾这组就是最新桶，未收盘，丢弃
    debug_assert_eq!(current_bucket, newest_bucket);

    rows
}

/// 聚合一个已收盘桶
///
/// 返回None表示该桶的派生统计量出现非有限值，整桶丢弃
fn aggregate_group(
    symbol: &str,
    bucket: i64,
    group: &[&MinuteBar],
    twap_5m_by_bucket: Option<&HashMap<i64, f64>>,
) -> Option<AggRow> {
    if group.is_empty() {
        return None;
    }

    let closes: Vec<f64> = group.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = group.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = group.iter().map(|b| b.low).collect();
    let high_opens: Vec<f64> = group.iter().map(|b| b.high - b.open).collect();
    let low_opens: Vec<f64> = group.iter().map(|b| b.low - b.open).collect();
    let ln_hls: Vec<f64> = group.iter().map(|b| (b.high / b.low).ln()).collect();
    let ln_hl_sqs: Vec<f64> = ln_hls.iter().map(|v| v * v).collect();

    // 首根K线的"前收盘"取其自身开盘价
    let mut diffs = Vec::with_capacity(group.len());
    diffs.push(group[0].close - group[0].open);
    for pair in group.windows(2) {
        diffs.push(pair[1].close - pair[0].close);
    }

    let row = AggRow {
        symbol: symbol.to_string(),
        open_time: bucket,
        open: group[0].open,
        high: highs.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        low: lows.iter().cloned().fold(f64::INFINITY, f64::min),
        close: group[group.len() - 1].close,
        volume: group.iter().map(|b| b.volume).sum(),
        quote_volume: group.iter().map(|b| b.quote_volume).sum(),
        trade_count: group.iter().map(|b| b.trade_count).sum(),
        taker_buy_volume: group.iter().map(|b| b.taker_buy_volume).sum(),
        taker_buy_quote_volume: group.iter().map(|b| b.taker_buy_quote_volume).sum(),
        twap: mean(&closes),
        twap_5m: twap_5m_by_bucket.map(|m| m.get(&bucket).copied().unwrap_or(f64::NAN)),
        close_std: std_pop(&closes),
        close_diff_std: std_pop(&diffs),
        high_mean: mean(&highs),
        low_mean: mean(&lows),
        high_open_mean: mean(&high_opens),
        low_open_mean: mean(&low_opens),
        ln_hl_mean: mean(&ln_hls),
        ln_hl_sq_mean: mean(&ln_hl_sqs),
    };

    if row.is_finite() {
        Some(row)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> MinuteBar {
        MinuteBar {
            open_time,
            open,
            high,
            low,
            close,
            volume: 2.0,
            quote_volume: 200.0,
            trade_count: 7,
            taker_buy_volume: 1.0,
            taker_buy_quote_volume: 100.0,
        }
    }

    /// 60根1分钟K线铺满[start, start+3600)，收盘价从base开始逐根加1
    fn hour_of_bars(start: i64, base: f64) -> Vec<MinuteBar> {
        (0..60)
            .map(|i| {
                let c = base + i as f64;
                bar(start + i * 60, c, c + 1.0, c - 1.0, c)
            })
            .collect()
    }

    #[test]
    fn test_newest_bucket_always_excluded() {
        // 一个小时整的数据只有一个桶，而它就是最新桶
        let bars = hour_of_bars(0, 100.0);
        assert!(aggregate("BTCUSDT", &bars, 3600).is_empty());
    }

    #[test]
    fn test_hour_scenario_closes_after_next_bar() {
        let mut bars = hour_of_bars(0, 100.0);
        bars.push(bar(3600, 160.0, 161.0, 159.0, 160.0));

        let rows = aggregate("BTCUSDT", &bars, 3600);
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.open_time, 0);
        assert_eq!(row.open, 100.0);
        assert_eq!(row.close, 159.0);
        assert_eq!(row.high, 160.0); // 最后一根的high = 159 + 1
        assert_eq!(row.low, 99.0);
        assert_eq!(row.volume, 120.0); // 60根 × 2.0
        assert_eq!(row.trade_count, 420);
        assert_eq!(row.twap, (100.0 + 159.0) / 2.0); // 等差序列均值
    }

    #[test]
    fn test_completeness_over_many_buckets() {
        // 三小时零一根，目标1h：应产出恰好3行（最新桶丢弃）
        let mut bars = Vec::new();
        for h in 0..3 {
            bars.extend(hour_of_bars(h * 3600, 100.0));
        }
        bars.push(bar(3 * 3600, 100.0, 101.0, 99.0, 100.0));

        let rows = aggregate("X", &bars, 3600);
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert!(row.low <= row.open && row.open <= row.high);
            assert!(row.low <= row.close && row.close <= row.high);
        }
        let times: Vec<i64> = rows.iter().map(|r| r.open_time).collect();
        assert_eq!(times, vec![0, 3600, 7200]);
    }

    #[test]
    fn test_close_std_is_population() {
        // 收盘价 1,2,3,4 -> 总体标准差 sqrt(1.25)
        let bars = vec![
            bar(0, 1.0, 1.5, 0.5, 1.0),
            bar(60, 2.0, 2.5, 1.5, 2.0),
            bar(120, 3.0, 3.5, 2.5, 3.0),
            bar(180, 4.0, 4.5, 3.5, 4.0),
            bar(300, 5.0, 5.5, 4.5, 5.0), // 下一个桶，让前一桶收盘
        ];
        let rows = aggregate("X", &bars, 300);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].close_std - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_close_diff_std_first_diff_uses_own_open() {
        // 首根: close 10.0, open 9.0 -> 首个差分是1.0
        // 第二根: close 10.0 -> 差分0.0；总体std = 0.5
        let bars = vec![
            bar(0, 9.0, 10.5, 8.5, 10.0),
            bar(60, 10.0, 10.5, 9.5, 10.0),
            bar(300, 11.0, 11.5, 10.5, 11.0),
        ];
        let rows = aggregate("X", &bars, 300);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].close_diff_std - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_singleton_bucket_stds_are_zero() {
        let bars = vec![bar(0, 1.0, 2.0, 0.5, 1.5), bar(300, 2.0, 2.5, 1.5, 2.0)];
        let rows = aggregate("X", &bars, 300);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close_std, 0.0);
        assert_eq!(rows[0].close_diff_std, 0.0);
    }

    #[test]
    fn test_twap_5m_from_sub_window_last_closes() {
        // 1h桶内两个5分钟子窗口：各自最后收盘价为12.0和14.0 -> twap_5m = 13.0
        let bars = vec![
            bar(0, 11.0, 12.5, 10.5, 11.0),
            bar(60, 11.0, 12.5, 10.5, 12.0), // 5m窗口0的最后一根
            bar(300, 13.0, 14.5, 12.5, 13.0),
            bar(360, 13.0, 14.5, 12.5, 14.0), // 5m窗口300的最后一根
            bar(3600, 14.0, 15.0, 13.5, 14.5),
        ];
        let rows = aggregate("X", &bars, 3600);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].twap_5m, Some(13.0));
    }

    #[test]
    fn test_no_twap_5m_for_5m_interval() {
        let bars = vec![bar(0, 1.0, 2.0, 0.5, 1.5), bar(300, 2.0, 2.5, 1.5, 2.0)];
        let rows = aggregate("X", &bars, 300);
        assert_eq!(rows[0].twap_5m, None);
    }

    #[test]
    fn test_non_finite_bucket_dropped() {
        // low为0让ln(high/low)发散，这一桶必须被丢弃而不是带病入库
        let bars = vec![
            bar(0, 1.0, 2.0, 0.0, 1.5),
            bar(300, 2.0, 2.5, 1.5, 2.0),
            bar(600, 3.0, 3.5, 2.5, 3.0),
        ];
        let rows = aggregate("X", &bars, 300);
        let times: Vec<i64> = rows.iter().map(|r| r.open_time).collect();
        assert_eq!(times, vec![300]);
    }
}

//! 细粒度缓冲区
//!
//! 每个品种一条按open_time升序的1分钟K线序列。merge负责把乱序、重叠、
//! 含修正的批次并进来：同一open_time后写的赢（WebSocket会对未收盘的
//! 最后一根K线反复推送修正），完全早于已保留区间的行按陈旧数据丢弃。
//! 聚合投递之后按最小水位线裁剪，只保留各周期尚未出完的桶所需的历史。

use crate::klcommon::MinuteBar;
use std::collections::HashMap;

/// 单品种1分钟K线缓冲区
#[derive(Debug, Default)]
pub struct MinuteBuffer {
    /// 按open_time升序，open_time唯一
    bars: Vec<MinuteBar>,
}

impl MinuteBuffer {
    pub fn new() -> Self {
        Self { bars: Vec::new() }
    }

    /// 并入一批1分钟K线
    ///
    /// 规则：
    /// - 早于缓冲区最早保留时间的行丢弃（陈旧）
    /// - 重复open_time按"后出现者覆盖"解决，批内顺序保留语义
    /// - 结果按open_time稳定升序
    pub fn merge(&mut self, rows: Vec<MinuteBar>) {
        if rows.is_empty() {
            return;
        }

        let min_retained = self.bars.first().map(|b| b.open_time);

        // 旧内容在前、新批次在后拼接，后出现的下标覆盖先出现的
        let mut merged = std::mem::take(&mut self.bars);
        for row in rows {
            if let Some(min) = min_retained {
                if row.open_time < min {
                    continue;
                }
            }
            merged.push(row);
        }

        let mut last_index: HashMap<i64, usize> = HashMap::with_capacity(merged.len());
        for (i, bar) in merged.iter().enumerate() {
            last_index.insert(bar.open_time, i);
        }

        let mut deduped: Vec<MinuteBar> = merged
            .into_iter()
            .enumerate()
            .filter(|(i, bar)| last_index[&bar.open_time] == *i)
            .map(|(_, bar)| bar)
            .collect();

        deduped.sort_by_key(|b| b.open_time);
        self.bars = deduped;
    }

    /// 裁剪缓冲区，只保留open_time大于最小水位线的行
    pub fn trim(&mut self, min_watermark: i64) {
        self.bars.retain(|b| b.open_time > min_watermark);
    }

    pub fn bars(&self) -> &[MinuteBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

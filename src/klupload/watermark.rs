//! 水位线跟踪
//!
//! 每个(周期, 品种)维护独立水位线：已经入队（不一定已落库）的最大桶时间。
//! 入队即推进，保证同一行不会被重复提交；落库失败由上传器自己重试，
//! 不回退水位线。

use std::collections::HashMap;

#[derive(Default)]
pub struct WatermarkTracker {
    marks: HashMap<(String, String), i64>,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从存储端的MAX(open_time)初始化水位线，启动时调用一次
    pub fn seed(&mut self, interval: &str, symbol: &str, open_time: i64) {
        self.marks
            .insert((interval.to_string(), symbol.to_string()), open_time);
    }

    /// 未初始化的(周期, 品种)水位线为0
    pub fn get(&self, interval: &str, symbol: &str) -> i64 {
        self.marks
            .get(&(interval.to_string(), symbol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// 只放行严格高于水位线的行
    pub fn admit<T, F>(&self, interval: &str, symbol: &str, rows: Vec<T>, open_time: F) -> Vec<T>
    where
        F: Fn(&T) -> i64,
    {
        let mark = self.get(interval, symbol);
        rows.into_iter()
            .filter(|row| open_time(row) > mark)
            .collect()
    }

    /// 推进到新入队行的最大桶时间，只升不降
    pub fn advance(&mut self, interval: &str, symbol: &str, open_time: i64) {
        let key = (interval.to_string(), symbol.to_string());
        let entry = self.marks.entry(key).or_insert(0);
        if open_time > *entry {
            *entry = open_time;
        }
    }

    /// 某品种在所有周期上的最小水位线，用于裁剪1分钟缓冲
    ///
    /// 任何一个周期还没有水位线时返回None——此时不能裁剪
    pub fn min_watermark(&self, symbol: &str, intervals: &[String]) -> Option<i64> {
        intervals
            .iter()
            .map(|interval| {
                self.marks
                    .get(&(interval.clone(), symbol.to_string()))
                    .copied()
            })
            .collect::<Option<Vec<i64>>>()
            .and_then(|marks| marks.into_iter().min())
    }
}

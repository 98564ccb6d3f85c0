//! 币安K线聚合上传服务
//!
//! 从1分钟K线（WebSocket实时流 + REST历史补齐）聚合出粗周期统计行，
//! 按(品种, 桶时间)幂等写入分析存储。
//!
//! - [`klcommon`]: 共享基础设施（配置、错误、日志、存储、行情接入、看门狗）
//! - [`klupload`]: 核心流水线（缓冲、聚合、水位线、批量上传、调度）

pub mod klcommon;
pub mod klupload;

pub use klcommon::{AppError, Result};

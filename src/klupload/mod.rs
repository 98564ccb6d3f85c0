//! K线聚合上传流水线
//!
//! 接入(1分钟实时流 + REST历史补齐) → 缓冲 → 周期聚合 → 水位线放行 →
//! 批量上传。各环节的职责边界见各子模块文档。

pub mod aggregator;
pub mod buffer;
pub mod ingestor;
pub mod uploader;
pub mod watermark;


pub use aggregator::aggregate;
pub use buffer::MinuteBuffer;
pub use ingestor::{IngestService, MarketIngestor};
pub use uploader::BatchingUploader;
pub use watermark::WatermarkTracker;

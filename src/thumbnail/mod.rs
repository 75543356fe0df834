//! # 缩略图模块（thumbnail）
//!
//! ## 设计思路
//!
//! 为剪贴板历史中的图片条目按需生成缩略图：同一张图在不同显示尺寸下被频繁请求，
//! 原图可能很大，也可能尚未同步到本地。模块按职责拆分为：
//!
//! - `decoder`：解码 + 像素限制 + 覆盖式降采样 + 磁盘编码
//! - `memory_cache`：进程内 LRU 位图缓存（条目数 + 开销双预算）
//! - `disk_cache`：以缓存键为索引的持久化字节缓存
//! - `invalidation`：判断磁盘缓存分辨率是否满足新请求
//! - `coalescer`：同一键的并发请求合并为一次在途操作
//! - `scheduler`：有界并发的解码任务池
//! - `provider`：原图字节 / 原图尺寸来源
//! - `pipeline`：对外入口，编排以上各层
//! - `binding`：显示目标与请求的绑定（复用单元格时取消旧请求）
//! - `config/error/source`：配置、错误、数据模型
//!
//! ## 实现思路
//!
//! 对外仅暴露必要类型，内部细节保持 `mod` 私有。
//!
//! ## 调用链
//!
//! ```text
//! 显示目标 / 调用方
//!    ↓
//! binding.rs（可选：占位图 + 取消旧请求）
//!    ↓
//! pipeline.rs  load_thumbnail
//!    ├─ memory_cache.rs（命中即返回）
//!    ├─ coalescer.rs（已有在途操作 → 等待结果）
//!    └─ 新操作
//!        ├─ disk_cache.rs + invalidation.rs（磁盘探测 + 分辨率判定）
//!        └─ scheduler.rs（占用解码槽位）
//!            ├─ provider.rs（取字节 + 签名校验）
//!            ├─ decoder.rs（解码 + 降采样）
//!            └─ 写 disk_cache / memory_cache → coalescer.complete 广播
//! ```
//!
//! ## 分层职责建议
//!
//! - 策略与预算变更优先改 `config.rs`
//! - 编排顺序变更优先改 `pipeline.rs`
//! - 单阶段行为优化分别改 `decoder/disk_cache/memory_cache`
//! - “同一张图被解码了多次”问题优先看 `coalescer.rs` 与 `pipeline.rs`

mod binding;
mod coalescer;
mod config;
mod decoder;
mod disk_cache;
mod error;
mod invalidation;
mod memory_cache;
mod pipeline;
mod provider;
mod scheduler;
mod source;

pub use binding::{CanDisplay, DisplayBinding};
pub use coalescer::CoalescerStats;
pub use config::{ResizeFilter, ThumbnailConfig, ThumbnailFormat, ThumbnailPerformanceProfile};
pub use disk_cache::{DiskCache, DiskEntryMeta};
pub use error::ThumbnailError;
pub use invalidation::should_invalidate;
pub use memory_cache::MemoryCache;
pub use pipeline::{PipelineBuilder, PipelineStats, ThumbnailHandle, ThumbnailPipeline};
pub use provider::{ByteProvider, FileByteProvider, NoOriginalSize, OriginalSizeProvider};
pub use scheduler::{DecodeJob, DecodeScheduler, JobHandle, SchedulerStats};
pub use source::{
    CacheKey, CacheTier, DecodeRequest, DecodedImage, InvalidationFn, InvalidationPolicy, PixelSize,
    PointSize, RequestId, SourceRef, ThumbnailOutcome,
};

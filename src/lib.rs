//! # 剪贴板历史缩略图 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          调用方（历史列表单元格 / 预览面板 / 网格）        │
//! │                                                          │
//! │   DisplayBinding ── CanDisplay（set_image 回调）          │
//! └───────┬──────────────────────────────────────────────────┘
//!         ↕ load_thumbnail / read_cache_only / cancel
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕            缩略图子系统 (Rust)                   │
//! │                                                          │
//! │  ┌─ error ────── AppError (统一错误类型)                  │
//! │  │                                                       │
//! │  ├─ thumbnail ── ThumbnailPipeline（对外入口）            │
//! │  │   ├─ memory_cache / disk_cache   两级缓存             │
//! │  │   ├─ coalescer / scheduler       合并与有界并发       │
//! │  │   └─ decoder / invalidation      解码与失效判定       │
//! │  │                                                       │
//! │  ├─ settings     配置读写（JSON）                         │
//! │  └─ storage      缓存目录解析与占用统计                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，外围操作的返回类型 |
//! | [`thumbnail`] | 缩略图加载、两级缓存、请求合并、解码调度 |
//! | [`settings`] | `ThumbnailConfig` 的 JSON 持久化 |
//! | [`storage`] | 缩略图缓存目录的解析与占用统计 |
//!
//! 本库只通过 `log` 门面输出日志，不安装任何日志实现。

pub mod error;
pub mod settings;
pub mod storage;
pub mod thumbnail;

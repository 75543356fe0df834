//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 缩略图链路内部使用 `ThumbnailError`，并且从不向加载调用方抛出；
//! 设置读写、目录解析等外围操作使用 `AppError`，
//! 替代分散的 `.map_err(|e| e.to_string())`、`expect()` 等不一致模式。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ThumbnailError` 与 `std::io::Error` 提供 `From` 转换，无需手动 map。

use crate::thumbnail::ThumbnailError;

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 缩略图流水线错误（构建 / 清空缓存 / 切换档位）
    #[error("{0}")]
    Thumbnail(#[from] ThumbnailError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 存储目录不可用
    #[error("存储目录不可用: {0}")]
    Storage(String),

    /// 配置文件无法解析或取值非法
    #[error("配置错误: {0}")]
    Config(String),
}

impl From<AppError> for String {
    fn from(error: AppError) -> Self {
        error.to_string()
    }
}

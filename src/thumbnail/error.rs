//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载缩略图链路中的所有错误来源，避免字符串拼接式错误处理。
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! 错误需要 `Clone`：一次解码失败会被广播给同一缓存键上的全部等待者。

/// 缩略图处理统一错误类型。
///
/// 这些错误只在流水线内部流转，对外统一收敛为“无结果”。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThumbnailError {
    /// 原始字节暂不可用（例如尚未从云端同步）。
    #[error("源图片不可用：{0}")]
    SourceUnavailable(String),

    #[error("解码错误：{0}")]
    Decode(String),

    #[error("格式错误：{0}")]
    InvalidFormat(String),

    /// 磁盘缓存读写失败，流水线内按未命中处理。
    #[error("磁盘缓存错误：{0}")]
    DiskIo(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    /// 缺少 tokio 运行时等环境问题。
    #[error("运行时错误：{0}")]
    Runtime(String),
}

impl ThumbnailError {
    /// 稳定错误码，供外部日志/监控系统归类。
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "E_SOURCE_UNAVAILABLE",
            Self::Decode(_) => "E_DECODE",
            Self::InvalidFormat(_) => "E_INVALID_FORMAT",
            Self::DiskIo(_) => "E_DISK_IO",
            Self::ResourceLimit(_) => "E_RESOURCE_LIMIT",
            Self::Runtime(_) => "E_RUNTIME",
        }
    }

    /// 错误发生的流水线阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "fetch",
            Self::Decode(_) | Self::InvalidFormat(_) | Self::ResourceLimit(_) => "decode",
            Self::DiskIo(_) => "cache",
            Self::Runtime(_) => "schedule",
        }
    }
}

impl From<ThumbnailError> for String {
    fn from(error: ThumbnailError) -> Self {
        error.to_string()
    }
}

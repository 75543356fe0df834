//! # 请求与中间模型
//!
//! ## 设计思路
//!
//! 将“外部请求语义”和“流水线中间结果”解耦：
//! - `CacheKey` / `SourceRef` / `RequestId` 表示调用方给出的标识
//! - `DecodeRequest` 表示一次完整的缩略图请求
//! - `DecodedImage` 表示解码完成、可被多方共享的位图
//! - `ThumbnailOutcome` 表示广播给等待者的最终结果

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use super::ThumbnailError;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// 缓存键：标识某个（源图、尺寸语境）组合的缩略图变体。
///
/// 内部为 `Arc<str>`，在注册表、缓存、任务之间克隆只增加引用计数。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Arc::from(key.into()))
    }

    /// 带命名空间的缓存键，例如 `grid-cell/clip-42` 与 `preview/clip-42` 互不冲突。
    ///
    /// # 示例
    /// ```rust
    /// use clip_thumbnails::thumbnail::CacheKey;
    ///
    /// let key = CacheKey::namespaced("grid-cell", "clip-42");
    /// assert_eq!(key.as_str(), "grid-cell/clip-42");
    /// ```
    pub fn namespaced(namespace: &str, id: &str) -> Self {
        Self::new(format!("{}/{}", namespace, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 源图片标识，由外部 `ByteProvider` 解析为原始字节。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef(Arc<str>);

impl SourceRef {
    pub fn new(source: impl Into<String>) -> Self {
        Self(Arc::from(source.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 单次调用的唯一标识，用于取消。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// 分配一个进程内唯一、单调递增的请求 ID。
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 像素尺寸。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 逻辑尺寸（point），乘以显示倍率得到像素尺寸。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSize {
    pub width: f64,
    pub height: f64,
}

impl PointSize {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// 按显示倍率换算为像素尺寸，向上取整且至少为 1。
    pub fn to_pixels(self, display_scale: f64) -> PixelSize {
        let scale = if display_scale.is_finite() && display_scale > 0.0 {
            display_scale
        } else {
            1.0
        };
        let to_px = |points: f64| {
            let px = (points * scale).ceil();
            if px.is_finite() && px >= 1.0 {
                px.min(u32::MAX as f64) as u32
            } else {
                1
            }
        };
        PixelSize::new(to_px(self.width), to_px(self.height))
    }
}

/// 自定义失效判定：`(原图尺寸, 已缓存像素尺寸, 请求 point 尺寸, 显示倍率) -> 是否失效`。
pub type InvalidationFn = dyn Fn(PixelSize, PixelSize, PointSize, f64) -> bool + Send + Sync;

/// 磁盘缓存命中后的失效策略。
#[derive(Clone, Default)]
pub enum InvalidationPolicy {
    /// 按分辨率判定（默认），见 `invalidation::should_invalidate`。
    #[default]
    Resolution,
    /// 始终信任磁盘缓存。
    Never,
    Custom(Arc<InvalidationFn>),
}

impl fmt::Debug for InvalidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution => f.write_str("Resolution"),
            Self::Never => f.write_str("Never"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// 一次缩略图请求。
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub request_id: RequestId,
    pub source: SourceRef,
    pub cache_key: CacheKey,
    /// 目标显示尺寸（point）。
    pub target_size: PointSize,
    /// 显示倍率（每 point 像素数）。
    pub display_scale: f64,
    /// 已知的原图像素尺寸；缺省时依次询问 `OriginalSizeProvider` 与磁盘元数据。
    pub original_size: Option<PixelSize>,
    pub invalidation: InvalidationPolicy,
}

impl DecodeRequest {
    /// # 示例
    /// ```rust
    /// use clip_thumbnails::thumbnail::{CacheKey, DecodeRequest, PixelSize, PointSize};
    ///
    /// let request = DecodeRequest::new(
    ///     "clips/42.png",
    ///     CacheKey::namespaced("grid-cell", "42"),
    ///     PointSize::new(80.0, 80.0),
    ///     2.0,
    /// )
    /// .with_original_size(PixelSize::new(1200, 900));
    ///
    /// assert_eq!(request.target_pixels(), PixelSize::new(160, 160));
    /// ```
    pub fn new(
        source: impl Into<SourceRef>,
        cache_key: impl Into<CacheKey>,
        target_size: PointSize,
        display_scale: f64,
    ) -> Self {
        Self {
            request_id: RequestId::next(),
            source: source.into(),
            cache_key: cache_key.into(),
            target_size,
            display_scale,
            original_size: None,
            invalidation: InvalidationPolicy::default(),
        }
    }

    pub fn with_original_size(mut self, size: PixelSize) -> Self {
        self.original_size = Some(size);
        self
    }

    pub fn with_invalidation(mut self, policy: InvalidationPolicy) -> Self {
        self.invalidation = policy;
        self
    }

    /// 目标像素框。
    pub fn target_pixels(&self) -> PixelSize {
        self.target_size.to_pixels(self.display_scale)
    }
}

impl From<String> for SourceRef {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// 解码完成的位图，产生后不可变。
///
/// 写入内存缓存后以 `Arc` 共享给所有读者，没有独占所有者。
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pixels: RgbaImage,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn size(&self) -> PixelSize {
        PixelSize::new(self.pixels.width(), self.pixels.height())
    }

    /// 内存开销估算（RGBA 字节数），用于内存缓存淘汰。
    pub fn cost(&self) -> usize {
        self.pixels.as_raw().len()
    }
}

/// 读取阶段输出：原始字节与来源标识。
pub(crate) struct RawImageData {
    pub(crate) bytes: bytes::Bytes,
    /// 来源提示（用于日志与诊断）。
    pub(crate) source_hint: SourceRef,
}

/// 结果来自哪一层。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Disk,
    Decoded,
}

/// 广播给等待者的最终结果。
#[derive(Debug, Clone)]
pub enum ThumbnailOutcome {
    Loaded {
        image: Arc<DecodedImage>,
        tier: CacheTier,
    },
    Failed(ThumbnailError),
    Cancelled,
}

impl ThumbnailOutcome {
    pub fn image(&self) -> Option<Arc<DecodedImage>> {
        match self {
            Self::Loaded { image, .. } => Some(Arc::clone(image)),
            Self::Failed(_) | Self::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

//! # 磁盘缓存失效判定
//!
//! 判断一张已落盘的缩略图是否满足新的显示尺寸。窗口旋转、分屏、单元格变大等场景
//! 会以同一个缓存键请求更高分辨率，此时低分辨率缓存必须被识别并重新生成。
//!
//! 规则：
//! - 原图在两个方向上都不大于请求的 point 尺寸时，永不失效（无法得到更清晰的结果）。
//! - 否则请求像素 = point × 倍率，并按原图尺寸封顶；缓存像素在任一方向上不足即失效，
//!   容差为零。

use super::source::{InvalidationPolicy, PixelSize, PointSize};

/// 判断磁盘缓存的缩略图是否需要重新生成。
///
/// 与朴素公式（point × 倍率 直接比较）不同，请求像素会按原图尺寸逐轴封顶，这是有意的：
/// 缓存已经保存了原图全部像素时（例如极细长图按比例缩放后某一轴达不到请求框），
/// 再生成也不会更清晰，不封顶会导致每次请求都重新解码。
///
/// # 示例
/// ```rust
/// use clip_thumbnails::thumbnail::{should_invalidate, PixelSize, PointSize};
///
/// let requested = PointSize::new(80.0, 80.0);
/// assert!(should_invalidate(PixelSize::new(100, 100), PixelSize::new(50, 50), requested, 2.0));
/// assert!(!should_invalidate(PixelSize::new(40, 40), PixelSize::new(50, 50), requested, 2.0));
/// ```
pub fn should_invalidate(
    original: PixelSize,
    cached: PixelSize,
    requested: PointSize,
    display_scale: f64,
) -> bool {
    if original.width as f64 <= requested.width && original.height as f64 <= requested.height {
        return false;
    }

    let requested_width = (requested.width * display_scale).min(original.width as f64);
    let requested_height = (requested.height * display_scale).min(original.height as f64);

    requested_width - cached.width as f64 > 0.0 || requested_height - cached.height as f64 > 0.0
}

/// 按请求携带的策略执行判定。
pub(crate) fn evaluate(
    policy: &InvalidationPolicy,
    original: PixelSize,
    cached: PixelSize,
    requested: PointSize,
    display_scale: f64,
) -> bool {
    match policy {
        InvalidationPolicy::Resolution => should_invalidate(original, cached, requested, display_scale),
        InvalidationPolicy::Never => false,
        InvalidationPolicy::Custom(predicate) => predicate(original, cached, requested, display_scale),
    }
}

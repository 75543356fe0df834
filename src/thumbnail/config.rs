//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `ThumbnailConfig`，保证运行时行为可观测、可调整、可测试。
//! 其中性能档位（quality / balanced / speed）作为高层语义，映射到底层参数组合。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的平衡配置。
//! - `ThumbnailPerformanceProfile` 负责档位字符串解析与反向输出。
//! - `apply_performance_profile` 将档位转换为具体阈值。
//! - `infer_performance_profile` 用于从当前配置反推档位。
//! - 配置整体可经 serde 序列化，由 `settings` 模块落盘。

use std::num::NonZeroUsize;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use super::ThumbnailError;

/// 降采样滤镜（可序列化版本，映射到 `image` / `fast_image_resize` 的滤镜）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl ResizeFilter {
    pub(crate) fn to_image_filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Gaussian => FilterType::Gaussian,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// 磁盘缓存中缩略图的编码格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailFormat {
    /// 无损，保留透明通道。
    Png,
    /// 体积更小，透明通道会被丢弃。
    Jpeg,
}

/// 缩略图流水线配置。
///
/// 字段覆盖了读取、解码、降采样、内存缓存、磁盘缓存与调度六个方面。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// 原始字节允许的最大体积（字节）。
    pub max_source_bytes: u64,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
    /// 降采样滤镜策略。
    pub resize_filter: ResizeFilter,
    /// 写入磁盘缓存时的编码格式。
    pub disk_format: ThumbnailFormat,
    /// JPEG 编码质量（1~100），仅 `disk_format = jpeg` 时生效。
    pub jpeg_quality: u8,
    /// 内存缓存最多保留的条目数。
    pub memory_cache_max_entries: usize,
    /// 内存缓存总开销上限（RGBA 字节），`None` 表示只按条目数淘汰。
    pub memory_cache_max_cost: Option<usize>,
    /// 磁盘缓存总体积上限（字节），`None` 表示不做容量淘汰。
    pub disk_cache_max_bytes: Option<u64>,
    /// 同时进行的解码任务上限。
    pub max_concurrent_decodes: usize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 50 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            resize_filter: ResizeFilter::Triangle,
            disk_format: ThumbnailFormat::Png,
            jpeg_quality: 85,
            memory_cache_max_entries: 200,
            memory_cache_max_cost: Some(96 * 1024 * 1024),
            disk_cache_max_bytes: Some(512 * 1024 * 1024),
            max_concurrent_decodes: 3,
        }
    }
}

/// 性能档位（面向产品/用户语义）。
///
/// - `Quality`：尽量保真
/// - `Balanced`：质量与性能平衡
/// - `Speed`：优先出图速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailPerformanceProfile {
    Quality,
    Balanced,
    Speed,
}

impl ThumbnailPerformanceProfile {
    /// 从外部字符串解析档位。
    ///
    /// # 示例
    /// ```rust
    /// use clip_thumbnails::thumbnail::ThumbnailPerformanceProfile;
    ///
    /// let p = ThumbnailPerformanceProfile::parse("balanced")?;
    /// assert_eq!(p.as_str(), "balanced");
    /// # Ok::<(), clip_thumbnails::thumbnail::ThumbnailError>(())
    /// ```
    pub fn parse(profile: &str) -> Result<Self, ThumbnailError> {
        match profile.trim().to_lowercase().as_str() {
            "quality" => Ok(Self::Quality),
            "balanced" => Ok(Self::Balanced),
            "speed" => Ok(Self::Speed),
            other => Err(ThumbnailError::InvalidFormat(format!(
                "未知性能档位：{}（可选：quality / balanced / speed）",
                other
            ))),
        }
    }

    /// 将档位输出为稳定字符串，供展示与持久化。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Balanced => "balanced",
            Self::Speed => "speed",
        }
    }
}

impl ThumbnailConfig {
    /// 基于当前参数反推性能档位。
    pub fn infer_performance_profile(&self) -> ThumbnailPerformanceProfile {
        match self.resize_filter {
            ResizeFilter::CatmullRom | ResizeFilter::Lanczos3
                if self.disk_format == ThumbnailFormat::Png =>
            {
                ThumbnailPerformanceProfile::Quality
            }
            ResizeFilter::Nearest => ThumbnailPerformanceProfile::Speed,
            _ => ThumbnailPerformanceProfile::Balanced,
        }
    }

    /// 应用指定性能档位到实际参数。
    ///
    /// 缓存容量不随档位变化，避免切档时清空已有缓存。
    pub fn apply_performance_profile(&mut self, profile: ThumbnailPerformanceProfile) {
        match profile {
            ThumbnailPerformanceProfile::Quality => {
                self.resize_filter = ResizeFilter::CatmullRom;
                self.disk_format = ThumbnailFormat::Png;
                self.max_concurrent_decodes = 2;
            }
            ThumbnailPerformanceProfile::Balanced => {
                self.resize_filter = ResizeFilter::Triangle;
                self.disk_format = ThumbnailFormat::Png;
                self.max_concurrent_decodes = 3;
            }
            ThumbnailPerformanceProfile::Speed => {
                self.resize_filter = ResizeFilter::Nearest;
                self.disk_format = ThumbnailFormat::Jpeg;
                self.max_concurrent_decodes = 4;
            }
        }
    }

    /// 校验配置取值范围。
    pub fn validate(&self) -> Result<(), ThumbnailError> {
        if self.memory_cache_max_entries == 0 {
            return Err(ThumbnailError::InvalidFormat(
                "memory_cache_max_entries 不能为 0".to_string(),
            ));
        }
        if self.max_concurrent_decodes == 0 {
            return Err(ThumbnailError::InvalidFormat(
                "max_concurrent_decodes 不能为 0".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ThumbnailError::InvalidFormat(
                "jpeg_quality 必须在 1~100 之间".to_string(),
            ));
        }
        if self.max_decoded_pixels == 0 || self.max_decoded_bytes == 0 {
            return Err(ThumbnailError::InvalidFormat(
                "解码像素/内存上限不能为 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn memory_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_cache_max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

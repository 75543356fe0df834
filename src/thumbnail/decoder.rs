//! # 解码与降采样模块
//!
//! ## 设计思路
//!
//! 纯函数式的“字节 → 缩略图位图”转换，不做任何缓存或 I/O。
//! 优先做尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 猜测格式并读取 header 尺寸
//! 2. 按像素/内存上限快速拒绝
//! 3. 完整解码
//! 4. 按“覆盖目标像素框、保持宽高比、绝不放大”的规则降采样
//! 5. 转换 RGBA，并校验字节长度一致性
//!
//! 另外提供磁盘缓存使用的编码（PNG/JPEG）与回读解码。

use std::io::Cursor;

use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgba};

use super::config::{ResizeFilter, ThumbnailFormat};
use super::source::{DecodedImage, PixelSize, RawImageData};
use super::{ThumbnailConfig, ThumbnailError};

/// 解码结果：缩略图与原图尺寸。
#[derive(Debug, Clone)]
pub struct DecodedThumbnail {
    pub image: DecodedImage,
    pub original_size: PixelSize,
}

/// 无状态图片解码器。
pub struct ImageDecoder;

impl ImageDecoder {
    /// 将原始字节解码为覆盖 `target` 像素框的缩略图。
    pub(crate) fn decode_thumbnail(
        raw: &RawImageData,
        target: PixelSize,
        config: &ThumbnailConfig,
    ) -> Result<DecodedThumbnail, ThumbnailError> {
        let _format: ImageFormat = image::guess_format(&raw.bytes)
            .map_err(|e| ThumbnailError::InvalidFormat(format!("不支持的图片格式：{}", e)))?;

        let (header_width, header_height) = Self::inspect_dimensions(&raw.bytes)?;
        Self::validate_pixel_limits(config, header_width, header_height)?;
        Self::validate_decoded_memory_limits(config, header_width, header_height)?;

        let decoded = image::load_from_memory(&raw.bytes)
            .map_err(|e| ThumbnailError::Decode(format!("图片解码失败：{}", e)))?;

        let (raw_width, raw_height) = decoded.dimensions();
        Self::validate_pixel_limits(config, raw_width, raw_height)?;
        Self::validate_decoded_memory_limits(config, raw_width, raw_height)?;

        let scaled = Self::downscale_to_cover(decoded, target, config.resize_filter)?;
        let (width, height) = scaled.dimensions();
        let rgba = scaled.into_rgba8();

        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| ThumbnailError::ResourceLimit("图片尺寸导致内存溢出风险".to_string()))?;

        if rgba.as_raw().len() != expected_len {
            return Err(ThumbnailError::Decode("解码后像素数据长度异常".to_string()));
        }

        log::debug!(
            "✅ 缩略图解码成功 - 来源: {} 原始尺寸: {}x{} 目标: {} 输出尺寸: {}x{}",
            raw.source_hint,
            raw_width,
            raw_height,
            target,
            width,
            height
        );

        Ok(DecodedThumbnail {
            image: DecodedImage::new(rgba),
            original_size: PixelSize::new(raw_width, raw_height),
        })
    }

    /// 解码磁盘缓存中已降采样的字节（廉价路径，不再缩放）。
    pub(crate) fn decode_cached(bytes: &[u8]) -> Result<DecodedImage, ThumbnailError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ThumbnailError::Decode(format!("缓存缩略图解码失败：{}", e)))?;
        Ok(DecodedImage::new(decoded.into_rgba8()))
    }

    /// 将缩略图编码为磁盘缓存字节。
    pub(crate) fn encode_for_disk(
        image: &DecodedImage,
        config: &ThumbnailConfig,
    ) -> Result<Vec<u8>, ThumbnailError> {
        let mut cursor = Cursor::new(Vec::new());
        match config.disk_format {
            ThumbnailFormat::Png => image
                .pixels()
                .write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| ThumbnailError::Decode(format!("PNG 编码失败：{}", e)))?,
            ThumbnailFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgba8(image.pixels().clone()).into_rgb8();
                let encoder = JpegEncoder::new_with_quality(&mut cursor, config.jpeg_quality);
                rgb.write_with_encoder(encoder)
                    .map_err(|e| ThumbnailError::Decode(format!("JPEG 编码失败：{}", e)))?;
            }
        }
        Ok(cursor.into_inner())
    }

    /// 仅通过内存中的图片头信息读取宽高。
    ///
    /// 用于完整解码前的像素限制检查，以及读取磁盘缓存条目的像素尺寸。
    pub(crate) fn inspect_dimensions(bytes: &[u8]) -> Result<(u32, u32), ThumbnailError> {
        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ThumbnailError::InvalidFormat(format!("无法识别图片格式：{}", e)))?;

        reader
            .into_dimensions()
            .map_err(|e| ThumbnailError::InvalidFormat(format!("无法读取图片尺寸：{}", e)))
    }

    fn validate_pixel_limits(
        config: &ThumbnailConfig,
        width: u32,
        height: u32,
    ) -> Result<(), ThumbnailError> {
        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| ThumbnailError::ResourceLimit("图片像素数溢出".to_string()))?;

        if pixels > config.max_decoded_pixels {
            return Err(ThumbnailError::ResourceLimit(format!(
                "图片像素过大：{} 像素（限制：{} 像素）",
                pixels, config.max_decoded_pixels
            )));
        }

        Ok(())
    }

    fn validate_decoded_memory_limits(
        config: &ThumbnailConfig,
        width: u32,
        height: u32,
    ) -> Result<(), ThumbnailError> {
        let estimated = (width as u64)
            .checked_mul(height as u64)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| ThumbnailError::ResourceLimit("图片解码内存估算溢出".to_string()))?;

        if estimated > config.max_decoded_bytes {
            return Err(ThumbnailError::ResourceLimit(format!(
                "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
                estimated as f64 / 1024.0 / 1024.0,
                config.max_decoded_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        Ok(())
    }

    /// 计算覆盖目标框的输出尺寸；不需要缩小时返回 `None`。
    pub(crate) fn cover_dimensions(source: PixelSize, target: PixelSize) -> Option<PixelSize> {
        if source.width == 0 || source.height == 0 {
            return None;
        }

        let scale = (target.width as f64 / source.width as f64)
            .max(target.height as f64 / source.height as f64);

        if scale >= 1.0 {
            return None;
        }

        // 抵消浮点误差，避免 160.00000001 被向上取整成 161。
        let fit = |length: u32| {
            let scaled = (length as f64 * scale - 1e-6).ceil();
            (scaled.max(1.0) as u32).min(length)
        };

        Some(PixelSize::new(fit(source.width), fit(source.height)))
    }

    fn downscale_to_cover(
        image: DynamicImage,
        target: PixelSize,
        filter: ResizeFilter,
    ) -> Result<DynamicImage, ThumbnailError> {
        let (width, height) = image.dimensions();
        let Some(output) = Self::cover_dimensions(PixelSize::new(width, height), target) else {
            return Ok(image);
        };

        log::debug!(
            "🧩 降采样：{}x{} -> {}（filter={:?}）",
            width,
            height,
            output,
            filter
        );

        match Self::resize_with_fast_image_resize(&image, output.width, output.height, filter) {
            Ok(resized) => Ok(resized),
            Err(err) => {
                log::warn!("⚠️ fast_image_resize 降采样失败，回退 image::resize_exact：{}", err);
                Ok(image.resize_exact(output.width, output.height, filter.to_image_filter()))
            }
        }
    }

    fn resize_with_fast_image_resize(
        image: &DynamicImage,
        target_width: u32,
        target_height: u32,
        filter: ResizeFilter,
    ) -> Result<DynamicImage, ThumbnailError> {
        let src = image.to_rgba8();
        let (src_width, src_height) = src.dimensions();

        let src_image = fr::images::Image::from_vec_u8(
            src_width,
            src_height,
            src.into_raw(),
            fr::PixelType::U8x4,
        )
        .map_err(|e| ThumbnailError::Decode(format!("构建源图像缓冲失败：{}", e)))?;

        let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

        let mut resizer = fr::Resizer::new();
        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(Self::to_fast_filter(filter)));

        resizer
            .resize(&src_image, &mut dst_image, Some(&options))
            .map_err(|e| ThumbnailError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

        let rgba = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(
            target_width,
            target_height,
            dst_image.into_vec(),
        )
        .ok_or_else(|| ThumbnailError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))?;

        Ok(DynamicImage::ImageRgba8(rgba))
    }

    fn to_fast_filter(filter: ResizeFilter) -> fr::FilterType {
        match filter {
            ResizeFilter::Nearest => fr::FilterType::Box,
            ResizeFilter::Triangle => fr::FilterType::Bilinear,
            ResizeFilter::CatmullRom => fr::FilterType::CatmullRom,
            ResizeFilter::Gaussian => fr::FilterType::Mitchell,
            ResizeFilter::Lanczos3 => fr::FilterType::Lanczos3,
        }
    }
}

//! # 原始字节来源
//!
//! ## 设计思路
//!
//! 原图字节来自外部（本地文件、同步中的资产库等），流水线只依赖一个同步的
//! “按来源取字节”接口。取数失败属于常态（例如尚未同步），一律以
//! `SourceUnavailable` 表达，由流水线收敛为空结果。
//!
//! ## 实现思路
//!
//! - `ByteProvider`：取原始字节，闭包可直接实现，便于测试与嵌入。
//! - `OriginalSizeProvider`：可选地提供原图尺寸，供磁盘缓存失效判定使用。
//! - `FileByteProvider`：存在性 + metadata 体积限制 + 读取，并可只读 header 给出原图尺寸。
//! - 取到的字节在进入解码前统一做体积与文件签名（magic bytes）校验。

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

use super::source::{PixelSize, SourceRef};
use super::ThumbnailError;

/// 按来源获取原图字节。
///
/// 在解码槽位内（阻塞线程上）调用，实现可以执行同步 I/O。
pub trait ByteProvider: Send + Sync {
    fn fetch(&self, source: &SourceRef) -> Result<Bytes, ThumbnailError>;
}

impl<F> ByteProvider for F
where
    F: Fn(&SourceRef) -> Result<Bytes, ThumbnailError> + Send + Sync,
{
    fn fetch(&self, source: &SourceRef) -> Result<Bytes, ThumbnailError> {
        self(source)
    }
}

/// 提供原图像素尺寸（若已知）。
pub trait OriginalSizeProvider: Send + Sync {
    fn original_size(&self, source: &SourceRef) -> Option<PixelSize>;
}

/// 不提供原图尺寸，失效判定退回到磁盘元数据。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOriginalSize;

impl OriginalSizeProvider for NoOriginalSize {
    fn original_size(&self, _source: &SourceRef) -> Option<PixelSize> {
        None
    }
}

/// 从本地文件系统读取原图。
///
/// 设置了根目录时，来源按相对路径解析，且不允许通过 `..` 跳出根目录。
#[derive(Debug, Clone)]
pub struct FileByteProvider {
    root: Option<PathBuf>,
    max_file_size: u64,
}

impl FileByteProvider {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            root: None,
            max_file_size,
        }
    }

    pub fn with_root(root: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            root: Some(root.into()),
            max_file_size,
        }
    }

    fn resolve(&self, source: &SourceRef) -> Result<PathBuf, ThumbnailError> {
        let relative = Path::new(source.as_str());
        let Some(root) = &self.root else {
            return Ok(relative.to_path_buf());
        };

        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ThumbnailError::SourceUnavailable(format!(
                "来源路径越出根目录：{}",
                source
            )));
        }
        Ok(root.join(relative))
    }
}

impl ByteProvider for FileByteProvider {
    fn fetch(&self, source: &SourceRef) -> Result<Bytes, ThumbnailError> {
        let path = self.resolve(source)?;
        log::debug!("📁 读取原图 - 路径: {}", path.display());

        if !path.exists() {
            return Err(ThumbnailError::SourceUnavailable(format!(
                "文件不存在：{}",
                path.display()
            )));
        }

        let metadata = std::fs::metadata(&path)
            .map_err(|e| ThumbnailError::SourceUnavailable(format!("无法读取文件信息：{}", e)))?;
        check_size(metadata.len(), self.max_file_size)?;

        let bytes = std::fs::read(&path)
            .map_err(|e| ThumbnailError::SourceUnavailable(format!("无法读取图片文件：{}", e)))?;
        Ok(Bytes::from(bytes))
    }
}

impl OriginalSizeProvider for FileByteProvider {
    fn original_size(&self, source: &SourceRef) -> Option<PixelSize> {
        let path = self.resolve(source).ok()?;
        let (width, height) = image::ImageReader::open(&path)
            .ok()?
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        Some(PixelSize::new(width, height))
    }
}

/// 解码前的统一校验：体积上限 + 文件签名必须是图片。
pub(crate) fn validate_source_bytes(bytes: &[u8], max_bytes: u64) -> Result<(), ThumbnailError> {
    check_size(bytes.len() as u64, max_bytes)?;

    if bytes.is_empty() {
        return Err(ThumbnailError::InvalidFormat("图片内容为空".to_string()));
    }

    let kind = infer::get(bytes)
        .ok_or_else(|| ThumbnailError::InvalidFormat("无法识别图片类型".to_string()))?;
    if kind.matcher_type() != infer::MatcherType::Image {
        return Err(ThumbnailError::InvalidFormat(format!(
            "文件签名不是图片类型：{}",
            kind.mime_type()
        )));
    }

    Ok(())
}

fn check_size(len: u64, max_bytes: u64) -> Result<(), ThumbnailError> {
    if len > max_bytes {
        return Err(ThumbnailError::ResourceLimit(format!(
            "文件过大：{:.2} MB（限制：{:.2} MB）",
            len as f64 / 1024.0 / 1024.0,
            max_bytes as f64 / 1024.0 / 1024.0
        )));
    }
    Ok(())
}

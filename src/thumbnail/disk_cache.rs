//! # 磁盘缓存
//!
//! ## 设计思路
//!
//! 以缓存键为索引的持久化字节存储，存放已降采样的缩略图编码。
//! 读失败（文件缺失、权限、损坏）一律视为未命中，由上层回落到重新生成；
//! 写失败只返回错误供上层记录日志，不影响本次请求结果。
//!
//! ## 实现思路
//!
//! - 键 → 文件名：键的 URL-safe Base64（无填充），扩展名 `.thumb`；
//!   超长键截断并追加哈希，避免超出文件系统的文件名长度限制。
//! - 旁路元数据 `.meta`（JSON）记录原图尺寸与缩略图像素尺寸，供失效判定使用。
//! - 先写临时文件再 `rename`，读者永远看不到写了一半的条目。
//! - 目录在首次写入时惰性创建；`clear` 删除整个目录后重建空目录。
//! - 可选字节预算：写入后超出预算时，先清扫过期的孤儿 `.meta` / `.tmp-*`，
//!   再按修改时间从旧到新删除条目。

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};

use super::source::{CacheKey, PixelSize};
use super::ThumbnailError;
use crate::storage::{self, StorageInfo};

const ENTRY_EXTENSION: &str = "thumb";
const META_EXTENSION: &str = "meta";
const MAX_ENCODED_NAME_LEN: usize = 160;

const TEMP_PREFIX: &str = ".tmp-";
/// 孤儿文件的最短存活时间，早于此时间的才会被清扫。
const ORPHAN_GRACE: Duration = Duration::from_secs(60);

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

/// 与缩略图一同落盘的尺寸记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEntryMeta {
    /// 生成缩略图时的原图像素尺寸。
    pub original: PixelSize,
    /// 缩略图本身的像素尺寸。
    pub pixel: PixelSize,
}

/// 基于目录的缩略图字节缓存。
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: Option<u64>,
    /// 已知的目录占用；`None` 表示尚未统计。
    size_bytes: Mutex<Option<u64>>,
}

impl DiskCache {
    /// 创建磁盘缓存，不会立即创建目录。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use clip_thumbnails::thumbnail::DiskCache;
    ///
    /// let cache = DiskCache::new("/tmp/clip-thumbnails", Some(256 * 1024 * 1024));
    /// assert!(cache.get(&"grid-cell/42".into()).is_none());
    /// ```
    pub fn new(dir: impl Into<PathBuf>, max_bytes: Option<u64>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            size_bytes: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 读取缓存字节；任何读错误都按未命中处理。
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => {
                log::warn!("⚠️ 磁盘缓存条目为空，按未命中处理 - key: {}", key);
                None
            }
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                log::warn!("⚠️ 读取磁盘缓存失败，按未命中处理 - key: {} err: {}", key, err);
                None
            }
        }
    }

    /// 读取旁路元数据；缺失或损坏时返回 `None`。
    pub fn meta(&self, key: &CacheKey) -> Option<DiskEntryMeta> {
        let content = fs::read(self.meta_path(key)).ok()?;
        match serde_json::from_slice::<DiskEntryMeta>(&content) {
            Ok(meta) => Some(meta),
            Err(err) => {
                log::debug!("磁盘缓存元数据损坏，忽略 - key: {} err: {}", key, err);
                None
            }
        }
    }

    /// 写入缓存字节（不带元数据）。
    pub fn set(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), ThumbnailError> {
        self.write_entry(key, bytes, None)
    }

    /// 写入缓存字节与尺寸元数据。
    pub fn set_with_meta(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        meta: DiskEntryMeta,
    ) -> Result<(), ThumbnailError> {
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| ThumbnailError::DiskIo(format!("序列化缓存元数据失败：{}", e)))?;
        self.write_entry(key, bytes, Some(&meta_bytes))
    }

    /// 删除条目；条目不存在不算错误。
    pub fn remove(&self, key: &CacheKey) {
        let mut freed = 0u64;
        for path in [self.entry_path(key), self.meta_path(key)] {
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => freed += len,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => log::warn!("⚠️ 删除磁盘缓存失败 - key: {} err: {}", key, err),
            }
        }

        if freed > 0 {
            if let Ok(mut size) = self.size_bytes.lock() {
                if let Some(current) = size.as_mut() {
                    *current = current.saturating_sub(freed);
                }
            }
        }
    }

    /// 清空全部缓存：删除目录并重建为空目录。
    pub fn clear(&self) -> Result<(), ThumbnailError> {
        let mut size = self
            .size_bytes
            .lock()
            .map_err(|_| ThumbnailError::DiskIo("磁盘缓存统计锁已中毒".to_string()))?;

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                *size = None;
                return Err(ThumbnailError::DiskIo(format!("删除缓存目录失败：{}", err)));
            }
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| ThumbnailError::DiskIo(format!("重建缓存目录失败：{}", e)))?;
        *size = Some(0);

        log::info!("🧹 磁盘缓存已清空 - dir: {}", self.dir.display());
        Ok(())
    }

    /// 目录占用（包含元数据文件）。
    pub fn usage(&self) -> StorageInfo {
        storage::dir_usage(&self.dir)
    }

    fn write_entry(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        meta: Option<&[u8]>,
    ) -> Result<(), ThumbnailError> {
        if bytes.is_empty() {
            return Err(ThumbnailError::DiskIo("拒绝写入空缓存条目".to_string()));
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| ThumbnailError::DiskIo(format!("创建缓存目录失败：{}", e)))?;

        let entry_path = self.entry_path(key);
        let meta_path = self.meta_path(key);
        let previous = file_len(&entry_path) + file_len(&meta_path);

        // 先写元数据：条目可见时元数据一定已经就绪。
        match meta {
            Some(meta) => self.write_atomically(&meta_path, meta)?,
            None => {
                let _ = fs::remove_file(&meta_path);
            }
        }
        self.write_atomically(&entry_path, bytes)?;

        let written = bytes.len() as u64 + meta.map(|m| m.len() as u64).unwrap_or(0);
        self.account_and_evict(&entry_path, previous, written);
        Ok(())
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<(), ThumbnailError> {
        let temp_path = self.dir.join(format!(
            "{}{}-{}",
            TEMP_PREFIX,
            std::process::id(),
            NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(err) = fs::write(&temp_path, bytes) {
            let _ = fs::remove_file(&temp_path);
            return Err(ThumbnailError::DiskIo(format!("写入缓存文件失败：{}", err)));
        }

        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            ThumbnailError::DiskIo(format!("提交缓存文件失败：{}", e))
        })
    }

    fn account_and_evict(&self, just_written: &Path, previous: u64, written: u64) {
        let mut size = match self.size_bytes.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let current = match *size {
            Some(current) => current.saturating_sub(previous).saturating_add(written),
            None => self.usage().total_size,
        };
        *size = Some(current);

        let Some(max_bytes) = self.max_bytes else {
            return;
        };
        if current <= max_bytes {
            return;
        }

        let remaining = self.evict_oldest(just_written, current, max_bytes);
        *size = Some(remaining);
    }

    /// 按修改时间从旧到新删除条目，直到不超过预算；刚写入的条目不参与淘汰。
    ///
    /// 淘汰前先清扫孤儿文件：没有对应 `.thumb` 的 `.meta`，以及残留的 `.tmp-*`。
    /// 两者都计入目录占用，只有超过 [`ORPHAN_GRACE`] 的才会删除，
    /// 正在写入（元数据先于条目落盘）的文件不受影响。
    fn evict_oldest(&self, just_written: &Path, mut current: u64, max_bytes: u64) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return current;
        };

        let now = SystemTime::now();
        let mut candidates: Vec<(SystemTime, PathBuf, u64)> = Vec::new();
        let mut orphans: Vec<(PathBuf, u64)> = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let stale = now
                .duration_since(modified)
                .map(|age| age >= ORPHAN_GRACE)
                .unwrap_or(false);

            match classify(&path) {
                FileKind::Entry if path != just_written => {
                    candidates.push((modified, path, metadata.len()));
                }
                FileKind::Meta if stale && !path.with_extension(ENTRY_EXTENSION).exists() => {
                    orphans.push((path, metadata.len()));
                }
                FileKind::Temp if stale => orphans.push((path, metadata.len())),
                _ => {}
            }
        }

        let mut swept = 0usize;
        for (path, len) in orphans {
            if fs::remove_file(&path).is_ok() {
                current = current.saturating_sub(len);
                swept += 1;
            }
        }

        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut evicted = 0usize;
        for (_, path, len) in candidates {
            if current <= max_bytes {
                break;
            }
            let meta_path = path.with_extension(META_EXTENSION);
            let meta_len = file_len(&meta_path);
            if fs::remove_file(&path).is_ok() {
                let _ = fs::remove_file(&meta_path);
                current = current.saturating_sub(len + meta_len);
                evicted += 1;
            }
        }

        log::debug!(
            "♻️ 磁盘缓存超出预算，清扫 {} 个孤儿文件，淘汰 {} 个条目（当前 {} 字节，预算 {} 字节）",
            swept,
            evicted,
            current,
            max_bytes
        );
        current
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(key), ENTRY_EXTENSION))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(key), META_EXTENSION))
    }
}

fn file_stem(key: &CacheKey) -> String {
    let encoded = general_purpose::URL_SAFE_NO_PAD.encode(key.as_str());
    if encoded.len() <= MAX_ENCODED_NAME_LEN {
        return encoded;
    }

    let mut hasher = DefaultHasher::new();
    key.as_str().hash(&mut hasher);
    format!("{}-{:016x}", &encoded[..MAX_ENCODED_NAME_LEN], hasher.finish())
}

enum FileKind {
    Entry,
    Meta,
    Temp,
    Other,
}

fn classify(path: &Path) -> FileKind {
    let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
    if name.starts_with(TEMP_PREFIX) {
        return FileKind::Temp;
    }
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ENTRY_EXTENSION) => FileKind::Entry,
        Some(META_EXTENSION) => FileKind::Meta,
        _ => FileKind::Other,
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

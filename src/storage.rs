//! 缩略图缓存目录管理模块
//!
//! # 设计思路
//!
//! 统一管理磁盘缓存的存放路径，支持用户自定义目录。
//! 与图片原件目录不同，缓存目录由磁盘缓存在首次写入时惰性创建，
//! 这里只负责解析路径与统计占用。
//!
//! # 实现思路
//!
//! - 优先使用用户在设置中配置的自定义目录。
//! - 未设置时回退到应用数据目录下的 `thumbnails` 子目录。
//! - 所有可能失败的操作均返回 `Result`，不使用 `expect()` / `unwrap()`。

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::AppError;

/// 默认缩略图子目录名。
pub const THUMBNAIL_DIR_NAME: &str = "thumbnails";

/// 存储目录信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub path: String,
    pub total_size: u64,
    pub file_count: u64,
}

/// 解析缩略图缓存目录
///
/// # 参数
/// * `data_dir` - 应用数据目录
/// * `custom_dir` - 用户自定义目录（可选）
///
/// # 返回
/// - `Ok(PathBuf)` — 缓存目录（不保证已存在）
/// - `Err(AppError::Storage)` — 自定义目录指向一个已存在的普通文件
pub fn resolve_thumbnail_dir(data_dir: &Path, custom_dir: Option<&str>) -> Result<PathBuf, AppError> {
    // 优先使用用户自定义目录
    if let Some(dir) = custom_dir.map(str::trim).filter(|dir| !dir.is_empty()) {
        let path = PathBuf::from(dir);
        if path.is_file() {
            return Err(AppError::Storage(format!(
                "自定义缩略图目录 '{}' 是一个文件",
                dir
            )));
        }
        return Ok(path);
    }

    Ok(data_dir.join(THUMBNAIL_DIR_NAME))
}

/// 统计目录占用（路径 + 占用大小 + 文件数）
///
/// 目录不存在时返回零占用。
pub fn dir_usage(dir: &Path) -> StorageInfo {
    let mut total_size: u64 = 0;
    let mut file_count: u64 = 0;

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    total_size += metadata.len();
                    file_count += 1;
                }
            }
        }
    }

    StorageInfo {
        path: dir.to_string_lossy().to_string(),
        total_size,
        file_count,
    }
}

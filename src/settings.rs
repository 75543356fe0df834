//! 缩略图配置的持久化
//!
//! 配置以格式化 JSON 保存；文件不存在时返回默认配置，缺失字段按默认值补齐。
//! 读入与写出前都会校验取值。

use std::fs;
use std::path::Path;

use crate::error::AppError;
use crate::thumbnail::ThumbnailConfig;

/// 默认配置文件名。
pub const SETTINGS_FILE_NAME: &str = "thumbnail_settings.json";

/// 读取配置；文件不存在时返回默认配置。
pub fn load_config(path: &Path) -> Result<ThumbnailConfig, AppError> {
    if !path.exists() {
        log::debug!("配置文件不存在，使用默认配置 - 路径: {}", path.display());
        return Ok(ThumbnailConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config = serde_json::from_str::<ThumbnailConfig>(&content)
        .map_err(|e| AppError::Config(format!("解析设置文件失败: {}", e)))?;
    config.validate()?;

    Ok(config)
}

/// 写出配置（格式化 JSON），必要时创建父目录。
pub fn save_config(path: &Path, config: &ThumbnailConfig) -> Result<(), AppError> {
    config.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::Storage(format!("创建设置目录失败: {}", e)))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("序列化设置失败: {}", e)))?;
    fs::write(path, content)?;

    log::info!("💾 缩略图配置已保存 - 路径: {}", path.display());
    Ok(())
}

// ==========================================
// 医院药品数据导入质控系统 - 导入配置项
// ==========================================

use crate::importer::archive_extractor::ArchiveLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置读取失败: {0}")]
    Storage(String),

    #[error("配置值非法: {key}={value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl From<rusqlite::Error> for ConfigError {
    fn from(err: rusqlite::Error) -> Self {
        ConfigError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Storage(err.to_string())
    }
}

/// 导入编排配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    pub worker_limit: usize,
    pub batch_size: usize,
    pub max_archive_bytes: u64,
    pub max_uncompressed_bytes: u64,
    pub max_retry_count: i32,
    pub progress_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub work_dir: PathBuf,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            batch_size: 500,
            max_archive_bytes: 100 * MIB,
            max_uncompressed_bytes: 500 * MIB,
            max_retry_count: 3,
            progress_ttl_secs: 1800,
            session_ttl_secs: 3600,
            lock_ttl_secs: 300,
            work_dir: default_work_dir(),
        }
    }
}

impl ImportSettings {
    pub fn archive_limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_archive_bytes: self.max_archive_bytes,
            max_uncompressed_bytes: self.max_uncompressed_bytes,
        }
    }

    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// 默认工作目录: {用户数据目录}/drug-import-qc/work
pub fn default_work_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("drug-import-qc")
        .join("work")
}

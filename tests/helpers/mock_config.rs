// ==========================================
// Mock 配置实现 - 用于集成测试
// ==========================================

use async_trait::async_trait;
use drug_import_qc::config::{ConfigError, ImportConfigReader};
use std::path::PathBuf;

/// Mock 配置结构
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub worker_limit: usize,
    pub batch_size: usize,
    pub max_archive_bytes: u64,
    pub max_uncompressed_bytes: u64,
    pub max_retry_count: i32,
    pub lock_ttl_secs: u64,
    pub work_dir: PathBuf,
    /// 为 true 时读取批次大小返回存储错误
    pub broken_storage: bool,
}

impl MockConfig {
    /// 创建默认配置
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            worker_limit: 2,
            batch_size: 7,
            max_archive_bytes: 1024 * 1024,
            max_uncompressed_bytes: 4 * 1024 * 1024,
            max_retry_count: 1,
            lock_ttl_secs: 60,
            work_dir,
            broken_storage: false,
        }
    }

    /// 压缩包上限很小的配置
    pub fn tiny_archive(work_dir: PathBuf, limit: u64) -> Self {
        let mut config = Self::new(work_dir);
        config.max_archive_bytes = limit;
        config
    }
}

#[async_trait]
impl ImportConfigReader for MockConfig {
    async fn get_worker_limit(&self) -> Result<usize, ConfigError> {
        Ok(self.worker_limit)
    }

    async fn get_batch_size(&self) -> Result<usize, ConfigError> {
        if self.broken_storage {
            return Err(ConfigError::Storage("config_kv 不可读".to_string()));
        }
        Ok(self.batch_size)
    }

    async fn get_max_archive_bytes(&self) -> Result<u64, ConfigError> {
        Ok(self.max_archive_bytes)
    }

    async fn get_max_uncompressed_bytes(&self) -> Result<u64, ConfigError> {
        Ok(self.max_uncompressed_bytes)
    }

    async fn get_max_retry_count(&self) -> Result<i32, ConfigError> {
        Ok(self.max_retry_count)
    }

    async fn get_progress_ttl_secs(&self) -> Result<u64, ConfigError> {
        Ok(600)
    }

    async fn get_session_ttl_secs(&self) -> Result<u64, ConfigError> {
        Ok(600)
    }

    async fn get_lock_ttl_secs(&self) -> Result<u64, ConfigError> {
        Ok(self.lock_ttl_secs)
    }

    async fn get_work_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.work_dir.clone())
    }
}

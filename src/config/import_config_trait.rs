// ==========================================
// 医院药品数据导入质控系统 - 导入配置读取 Trait
// ==========================================
// 职责: 定义编排层所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::config::settings::{ConfigError, ImportSettings};
use async_trait::async_trait;
use std::path::PathBuf;

// ==========================================
// ImportConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ImportConfigReader: Send + Sync {
    /// 明细并发上限
    ///
    /// # 默认值
    /// - 4
    async fn get_worker_limit(&self) -> Result<usize, ConfigError>;

    /// 每批写入行数（一批一个事务）
    ///
    /// # 默认值
    /// - 500
    async fn get_batch_size(&self) -> Result<usize, ConfigError>;

    /// 压缩包大小上限（字节）
    ///
    /// # 默认值
    /// - 100 MiB
    async fn get_max_archive_bytes(&self) -> Result<u64, ConfigError>;

    /// 解压后总大小上限（字节）
    ///
    /// # 默认值
    /// - 500 MiB
    async fn get_max_uncompressed_bytes(&self) -> Result<u64, ConfigError>;

    /// 明细最大重试次数
    ///
    /// # 默认值
    /// - 3
    async fn get_max_retry_count(&self) -> Result<i32, ConfigError>;

    /// 进度快照过期秒数（默认 1800）
    async fn get_progress_ttl_secs(&self) -> Result<u64, ConfigError>;

    /// 会话过期秒数（默认 3600）
    async fn get_session_ttl_secs(&self) -> Result<u64, ConfigError>;

    /// 任务锁过期秒数（默认 300）
    async fn get_lock_ttl_secs(&self) -> Result<u64, ConfigError>;

    /// 上传文件与解压文件的工作目录
    async fn get_work_dir(&self) -> Result<PathBuf, ConfigError>;

    /// 一次性读取全部导入配置
    async fn load_settings(&self) -> Result<ImportSettings, ConfigError> {
        Ok(ImportSettings {
            worker_limit: self.get_worker_limit().await?,
            batch_size: self.get_batch_size().await?,
            max_archive_bytes: self.get_max_archive_bytes().await?,
            max_uncompressed_bytes: self.get_max_uncompressed_bytes().await?,
            max_retry_count: self.get_max_retry_count().await?,
            progress_ttl_secs: self.get_progress_ttl_secs().await?,
            session_ttl_secs: self.get_session_ttl_secs().await?,
            lock_ttl_secs: self.get_lock_ttl_secs().await?,
            work_dir: self.get_work_dir().await?,
        })
    }
}

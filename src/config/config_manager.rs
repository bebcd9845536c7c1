// ==========================================
// 医院药品数据导入质控系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)，导入配置统一使用 import.* 键
// 规则: 缺失键取默认值；存在但无法解析的值返回 InvalidValue
// ==========================================

use crate::config::import_config_trait::ImportConfigReader;
use crate::config::settings::{default_work_dir, ConfigError, ImportSettings};
use crate::db::open_sqlite_connection;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
    defaults: ImportSettings,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, ConfigError> {
        let conn = open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            defaults: ImportSettings::default(),
        })
    }

    /// 从已有连接创建 ConfigManager（对连接再次应用统一 PRAGMA，幂等）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, ConfigError> {
        {
            let conn_guard = conn
                .lock()
                .map_err(|e| ConfigError::Storage(format!("锁获取失败: {}", e)))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }
        Ok(Self {
            conn,
            defaults: ImportSettings::default(),
        })
    }

    /// 替换缺省值（测试与命令行覆盖工作目录时使用）
    pub fn with_defaults(mut self, defaults: ImportSettings) -> Self {
        self.defaults = defaults;
        self
    }

    /// 读取 global scope 的配置值
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConfigError::Storage(format!("锁获取失败: {}", e)))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConfigError::Storage(format!("锁获取失败: {}", e)))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 导入配置快照（JSON，记录在任务创建日志中）
    pub fn get_config_snapshot(&self) -> Result<String, ConfigError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConfigError::Storage(format!("锁获取失败: {}", e)))?;

        let mut stmt = conn.prepare(
            "SELECT key, value FROM config_kv WHERE scope_id = 'global' AND key LIKE 'import.%' ORDER BY key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut config_map = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }
        Ok(serde_json::to_string(&config_map)?)
    }

    /// 读取并解析，缺失取默认
    fn get_parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_global_config_value(key)? {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    /// 读取正整数
    fn get_positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.get_parsed(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(value)
    }
}

// ==========================================
// ImportConfigReader Trait 实现
// ==========================================
#[async_trait]
impl ImportConfigReader for ConfigManager {
    async fn get_worker_limit(&self) -> Result<usize, ConfigError> {
        self.get_positive(config_keys::WORKER_LIMIT, self.defaults.worker_limit)
    }

    async fn get_batch_size(&self) -> Result<usize, ConfigError> {
        self.get_positive(config_keys::BATCH_SIZE, self.defaults.batch_size)
    }

    async fn get_max_archive_bytes(&self) -> Result<u64, ConfigError> {
        self.get_positive(config_keys::MAX_ARCHIVE_BYTES, self.defaults.max_archive_bytes)
    }

    async fn get_max_uncompressed_bytes(&self) -> Result<u64, ConfigError> {
        self.get_positive(
            config_keys::MAX_UNCOMPRESSED_BYTES,
            self.defaults.max_uncompressed_bytes,
        )
    }

    async fn get_max_retry_count(&self) -> Result<i32, ConfigError> {
        let value = self.get_parsed(config_keys::MAX_RETRY_COUNT, self.defaults.max_retry_count)?;
        if value < 0 {
            return Err(ConfigError::InvalidValue {
                key: config_keys::MAX_RETRY_COUNT.to_string(),
                value: value.to_string(),
                reason: "不能为负数".to_string(),
            });
        }
        Ok(value)
    }

    async fn get_progress_ttl_secs(&self) -> Result<u64, ConfigError> {
        self.get_positive(config_keys::PROGRESS_TTL_SECS, self.defaults.progress_ttl_secs)
    }

    async fn get_session_ttl_secs(&self) -> Result<u64, ConfigError> {
        self.get_positive(config_keys::SESSION_TTL_SECS, self.defaults.session_ttl_secs)
    }

    async fn get_lock_ttl_secs(&self) -> Result<u64, ConfigError> {
        self.get_positive(config_keys::LOCK_TTL_SECS, self.defaults.lock_ttl_secs)
    }

    async fn get_work_dir(&self) -> Result<PathBuf, ConfigError> {
        match self.get_global_config_value(config_keys::WORK_DIR)? {
            Some(raw) if !raw.trim().is_empty() => Ok(PathBuf::from(raw.trim())),
            _ if self.defaults.work_dir.as_os_str().is_empty() => Ok(default_work_dir()),
            _ => Ok(self.defaults.work_dir.clone()),
        }
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    pub const WORKER_LIMIT: &str = "import.worker_limit";
    pub const BATCH_SIZE: &str = "import.batch_size";
    pub const MAX_ARCHIVE_BYTES: &str = "import.max_archive_bytes";
    pub const MAX_UNCOMPRESSED_BYTES: &str = "import.max_uncompressed_bytes";
    pub const MAX_RETRY_COUNT: &str = "import.max_retry_count";

    // 缓存过期
    pub const PROGRESS_TTL_SECS: &str = "import.progress_ttl_secs";
    pub const SESSION_TTL_SECS: &str = "import.session_ttl_secs";
    pub const LOCK_TTL_SECS: &str = "import.lock_ttl_secs";

    pub const WORK_DIR: &str = "import.work_dir";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ensure_schema;
    use tempfile::NamedTempFile;

    fn manager() -> (NamedTempFile, ConfigManager) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = open_sqlite_connection(temp_file.path().to_str().unwrap()).unwrap();
        ensure_schema(&conn).unwrap();
        let manager = ConfigManager::from_connection(Arc::new(Mutex::new(conn))).unwrap();
        (temp_file, manager)
    }

    #[tokio::test]
    async fn test_defaults_when_keys_missing() {
        let (_tmp, manager) = manager();
        let settings = manager.load_settings().await.unwrap();
        let defaults = ImportSettings::default();
        assert_eq!(settings.worker_limit, 4);
        assert_eq!(settings.batch_size, 500);
        assert_eq!(settings.max_archive_bytes, defaults.max_archive_bytes);
        assert_eq!(settings.lock_ttl_secs, 300);
        assert_eq!(settings.work_dir, defaults.work_dir);
    }

    #[tokio::test]
    async fn test_overrides_and_invalid_values() {
        let (_tmp, manager) = manager();
        manager
            .set_global_config_value(config_keys::BATCH_SIZE, "50")
            .unwrap();
        assert_eq!(manager.get_batch_size().await.unwrap(), 50);

        manager
            .set_global_config_value(config_keys::WORKER_LIMIT, "many")
            .unwrap();
        assert!(matches!(
            manager.get_worker_limit().await,
            Err(ConfigError::InvalidValue { .. })
        ));

        manager
            .set_global_config_value(config_keys::LOCK_TTL_SECS, "0")
            .unwrap();
        assert!(manager.get_lock_ttl_secs().await.is_err());

        let snapshot = manager.get_config_snapshot().unwrap();
        assert!(snapshot.contains("import.batch_size"));
    }
}

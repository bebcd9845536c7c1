// ==========================================
// 医院药品数据导入质控系统 - 配置层
// ==========================================
// 职责: 导入配置管理（默认值 + config_kv 覆写）
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod import_config_trait;
pub mod settings;

pub use config_manager::{config_keys, ConfigManager};
pub use import_config_trait::ImportConfigReader;
pub use settings::{ConfigError, ImportSettings};

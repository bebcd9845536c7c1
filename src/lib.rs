// ==========================================
// 医院药品数据导入质控系统 - 核心库
// ==========================================
// 技术栈: Rust + SQLite + tokio
// 系统定位: 五类药品数据的批量导入与规则质控
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 编排与质控
pub mod engine;

// 导入层 - 解压/解析/落库
pub mod importer;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/建表）
pub mod db;

// 日志系统
pub mod logging;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    DetailStatus, ErrorLevel, ImportType, RuleCategory, RuleType, StageStatus, TableType,
    TaskStatus,
};

// 领域实体
pub use domain::{
    ImportSessionInfo, ImportTask, ImportTaskDetail, QcFinding, QcRule, TaskDetailProgressInfo,
    TaskProgressInfo,
};

// 引擎
pub use engine::{
    CacheBackend, ImportOrchestrator, InMemoryCache, QcRuleEngine, TaskError, TaskResult,
    TaskRunReport,
};

// 配置
pub use config::{ConfigManager, ImportConfigReader, ImportSettings};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "医院药品数据导入质控系统";

// ==========================================
// 医院药品数据导入质控系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 值一律参数化；表名/列名只来自表结构目录
// ==========================================

pub mod db_utils;
pub mod error;
pub mod import_task_repo;
pub mod qc_rule_repo;
pub mod table_data_repo;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use import_task_repo::ImportTaskRepository;
pub use qc_rule_repo::QcRuleRepository;
pub use table_data_repo::{RowOwner, TableDataRepository};

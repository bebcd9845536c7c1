// ==========================================
// 医院药品数据导入质控系统 - 引擎层
// ==========================================
// 职责: 任务编排、任务锁、进度缓存、质控规则引擎
// 红线: Engine 不拼 SQL；数据访问一律经仓储层
// ==========================================

pub mod cache;
pub mod error;
pub mod lock_manager;
pub mod orchestrator;
pub mod progress_store;
pub mod qc;

// 重导出核心引擎
pub use cache::{CacheBackend, CacheError, CacheResult, InMemoryCache};
pub use error::{TaskError, TaskResult};
pub use lock_manager::{TaskLockGuard, TaskLockManager};
pub use orchestrator::{generate_task_no, ImportOrchestrator, TaskRunReport};
pub use progress_store::TaskProgressStore;
pub use qc::{QcError, QcRuleEngine};

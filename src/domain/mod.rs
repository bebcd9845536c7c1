// ==========================================
// 医院药品数据导入质控系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型、状态推导规则
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod progress;
pub mod qc;
pub mod record;
pub mod table_schema;
pub mod task;
pub mod types;

// 重导出核心类型
pub use progress::{ImportSessionInfo, SessionStatus, TaskDetailProgressInfo, TaskProgressInfo};
pub use qc::{QcFinding, QcRule, RuleConfigIssue};
pub use record::{ImportRow, RawRow, RowRejection};
pub use table_schema::{ColumnKind, ColumnSpec, TableSchema};
pub use task::{
    compute_progress_percent, derive_task_status, FailedDetailSummary, ImportTask,
    ImportTaskDetail,
};
pub use types::{
    DetailStatus, ErrorLevel, ImportType, RuleCategory, RuleType, StageStatus, TableType,
    TaskStatus,
};

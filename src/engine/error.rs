// ==========================================
// 医院药品数据导入质控系统 - 编排层错误类型
// ==========================================
// 职责: 汇总各层错误，区分归类/结构/运行期错误
// 约定: code() 返回稳定错误码，is_retryable() 标记调用方可否稍后重试
// ==========================================

use crate::engine::cache::CacheError;
use crate::engine::qc::QcError;
use crate::importer::error::ImportError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    // ==========================================
    // 运行期错误（锁/重试/状态）
    // ==========================================
    #[error("任务已被锁定: task_id={task_id}, holder={holder}")]
    TaskLocked { task_id: i64, holder: String },

    #[error("未持有任务锁: task_id={task_id}, actor={actor}")]
    LockNotHeld { task_id: i64, actor: String },

    #[error("重试次数已达上限: detail_id={detail_id}, retry_count={retry_count}, max={max_retry_count}")]
    RetryLimitExceeded {
        detail_id: i64,
        retry_count: i32,
        max_retry_count: i32,
    },

    #[error("当前状态不允许该操作: task_id={task_id}, status={status}, operation={operation}")]
    InvalidState {
        task_id: i64,
        status: String,
        operation: &'static str,
    },

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("配置错误: {0}")]
    Config(String),

    // ==========================================
    // 下层错误
    // ==========================================
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Qc(#[from] QcError),
}

impl TaskError {
    /// 稳定错误码（对外契约）
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::TaskLocked { .. } => "TASK_LOCKED",
            TaskError::LockNotHeld { .. } => "LOCK_NOT_HELD",
            TaskError::RetryLimitExceeded { .. } => "RETRY_LIMIT_EXCEEDED",
            TaskError::InvalidState { .. } => "INVALID_STATE",
            TaskError::NotFound(_) => "NOT_FOUND",
            TaskError::Config(_) => "CONFIG_ERROR",
            TaskError::Cache(CacheError::Unavailable) => "CACHE_UNAVAILABLE",
            TaskError::Cache(_) => "CACHE_ERROR",
            TaskError::Import(e) if e.is_classification_error() => "CLASSIFICATION_ERROR",
            TaskError::Import(_) => "IMPORT_ERROR",
            TaskError::Repository(RepositoryError::LockError(_)) => "STORAGE_BUSY",
            TaskError::Repository(_) => "STORAGE_ERROR",
            TaskError::Qc(_) => "RULE_CONFIG_ERROR",
        }
    }

    /// 是否可稍后重试（锁竞争、缓存不可用、存储繁忙）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::TaskLocked { .. }
                | TaskError::Cache(CacheError::Unavailable)
                | TaskError::Repository(RepositoryError::LockError(_))
        )
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TableType;

    #[test]
    fn test_error_codes_and_retryability() {
        let locked = TaskError::TaskLocked {
            task_id: 1,
            holder: "u2".into(),
        };
        assert_eq!(locked.code(), "TASK_LOCKED");
        assert!(locked.is_retryable());

        let limit = TaskError::RetryLimitExceeded {
            detail_id: 3,
            retry_count: 3,
            max_retry_count: 3,
        };
        assert_eq!(limit.code(), "RETRY_LIMIT_EXCEEDED");
        assert!(!limit.is_retryable());

        let cache: TaskError = CacheError::Unavailable.into();
        assert_eq!(cache.code(), "CACHE_UNAVAILABLE");
        assert!(cache.is_retryable());

        let missing: TaskError = ImportError::MissingMandatoryFile(TableType::DrugCatalog).into();
        assert_eq!(missing.code(), "CLASSIFICATION_ERROR");
        assert!(!missing.is_retryable());
    }
}

// ==========================================
// 医院药品数据导入质控系统 - 进度快照与会话
// ==========================================
// 说明: 仅存在于缓存中的读投影，持久化任务/明细才是权威数据
// ==========================================

use crate::domain::task::{ImportTask, ImportTaskDetail};
use crate::domain::types::{DetailStatus, StageStatus, TableType, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressInfo {
    pub task_id: i64,
    pub task_no: String,
    pub status: TaskStatus,
    pub extract_status: StageStatus,
    pub import_status: StageStatus,
    pub qc_status: StageStatus,
    pub progress_percent: i32,
    pub total_files: i64,
    pub success_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub success_records: i64,
    pub failed_records: i64,
    pub current_stage: String,
    pub error_message: Option<String>,
    pub details: Vec<TaskDetailProgressInfo>,
    pub updated_at: DateTime<Utc>,
}

impl TaskProgressInfo {
    pub fn from_records(task: &ImportTask, details: &[ImportTaskDetail]) -> Self {
        Self {
            task_id: task.id,
            task_no: task.task_no.clone(),
            status: task.status,
            extract_status: task.extract_status,
            import_status: task.import_status,
            qc_status: task.qc_status,
            progress_percent: task.progress_percent,
            total_files: task.total_files,
            success_files: task.success_files,
            failed_files: task.failed_files,
            total_records: task.total_records,
            success_records: task.success_records,
            failed_records: task.failed_records,
            current_stage: task.status.to_string(),
            error_message: task.error_message.clone(),
            details: details.iter().map(TaskDetailProgressInfo::from_detail).collect(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetailProgressInfo {
    pub detail_id: i64,
    pub task_id: i64,
    pub table_type: TableType,
    pub file_name: String,
    pub status: DetailStatus,
    pub parse_status: StageStatus,
    pub import_status: StageStatus,
    pub qc_status: StageStatus,
    pub total_rows: i64,
    pub success_rows: i64,
    pub failed_rows: i64,
    pub progress_percent: i32,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskDetailProgressInfo {
    pub fn from_detail(detail: &ImportTaskDetail) -> Self {
        let progress_percent = if detail.total_rows > 0 {
            ((detail.processed_rows().min(detail.total_rows) * 100) / detail.total_rows) as i32
        } else if detail.status.is_terminal() {
            100
        } else {
            0
        };
        Self {
            detail_id: detail.id,
            task_id: detail.task_id,
            table_type: detail.table_type,
            file_name: detail.file_name.clone(),
            status: detail.status,
            parse_status: detail.parse_status,
            import_status: detail.import_status,
            qc_status: detail.qc_status,
            total_rows: detail.total_rows,
            success_rows: detail.success_rows,
            failed_rows: detail.failed_rows,
            progress_percent,
            retry_count: detail.retry_count,
            error_message: detail.error_message.clone(),
            updated_at: Utc::now(),
        }
    }
}

// ==========================================
// ImportSessionInfo - 编排会话（重启后续跑）
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSessionInfo {
    pub session_id: String,
    pub task_id: i64,
    pub user_id: String,
    pub session_status: SessionStatus,
    pub completed_items: Vec<TableType>,
    pub pending_items: Vec<TableType>,
    pub last_active_time: DateTime<Utc>,
}

impl ImportSessionInfo {
    pub fn new(session_id: String, task_id: i64, user_id: &str, pending: Vec<TableType>) -> Self {
        Self {
            session_id,
            task_id,
            user_id: user_id.to_string(),
            session_status: SessionStatus::Active,
            completed_items: Vec::new(),
            pending_items: pending,
            last_active_time: Utc::now(),
        }
    }

    /// 将某项由待处理移入已完成（保持顺序，重复调用幂等）
    pub fn complete_item(&mut self, item: TableType) {
        self.pending_items.retain(|t| *t != item);
        if !self.completed_items.contains(&item) {
            self.completed_items.push(item);
        }
        self.last_active_time = Utc::now();
    }
}

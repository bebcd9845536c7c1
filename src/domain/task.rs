// ==========================================
// 医院药品数据导入质控系统 - 导入任务与明细
// ==========================================
// 职责: 任务/明细实体 + 终态推导 + 进度计算
// 红线: 任务总状态由明细状态推导，不独立存储
// ==========================================

use crate::domain::types::{DetailStatus, ImportType, StageStatus, TableType, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// ImportTask - 导入任务
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTask {
    pub id: i64,
    pub task_no: String,
    pub task_name: String,
    pub source_file_name: String,
    pub source_file_path: Option<String>,
    pub source_file_size: i64,
    pub import_type: ImportType,
    pub status: TaskStatus,
    pub extract_status: StageStatus,
    pub import_status: StageStatus,
    pub qc_status: StageStatus,
    pub total_files: i64,
    pub success_files: i64,
    pub failed_files: i64,
    pub total_records: i64,
    pub success_records: i64,
    pub failed_records: i64,
    pub progress_percent: i32,
    pub extract_start_time: Option<DateTime<Utc>>,
    pub extract_end_time: Option<DateTime<Utc>>,
    pub import_start_time: Option<DateTime<Utc>>,
    pub import_end_time: Option<DateTime<Utc>>,
    pub qc_start_time: Option<DateTime<Utc>>,
    pub qc_end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>, // JSON: Vec<FailedDetailSummary>
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportTask {
    /// 新建待处理任务（id 由仓储回填）
    pub fn new_pending(
        task_no: String,
        task_name: String,
        source_file_name: String,
        source_file_size: i64,
        import_type: ImportType,
        created_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            task_no,
            task_name,
            source_file_name,
            source_file_path: None,
            source_file_size,
            import_type,
            status: TaskStatus::Pending,
            extract_status: StageStatus::Pending,
            import_status: StageStatus::Pending,
            qc_status: StageStatus::Pending,
            total_files: 0,
            success_files: 0,
            failed_files: 0,
            total_records: 0,
            success_records: 0,
            failed_records: 0,
            progress_percent: 0,
            extract_start_time: None,
            extract_end_time: None,
            import_start_time: None,
            import_end_time: None,
            qc_start_time: None,
            qc_end_time: None,
            error_message: None,
            error_detail: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// 按明细汇总文件/记录计数与进度（进度只增不减）
    pub fn apply_detail_totals(&mut self, details: &[ImportTaskDetail]) {
        self.total_files = self.total_files.max(details.len() as i64);
        self.success_files = details
            .iter()
            .filter(|d| d.status == DetailStatus::Success)
            .count() as i64;
        self.failed_files = details
            .iter()
            .filter(|d| d.status == DetailStatus::Failed)
            .count() as i64;
        self.total_records = self
            .total_records
            .max(details.iter().map(|d| d.total_rows).sum());
        self.success_records = details.iter().map(|d| d.success_rows).sum();
        self.failed_records = details.iter().map(|d| d.failed_rows).sum();

        let all_terminal = !details.is_empty() && details.iter().all(|d| d.status.is_terminal());
        let percent = compute_progress_percent(details, all_terminal);
        self.progress_percent = self.progress_percent.max(percent);
    }
}

// ==========================================
// ImportTaskDetail - 任务明细（每表类型一行）
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTaskDetail {
    pub id: i64,
    pub task_id: i64,
    pub table_type: TableType,
    pub file_name: String,
    pub file_path: Option<String>,
    pub status: DetailStatus,
    pub parse_status: StageStatus,
    pub import_status: StageStatus,
    pub qc_status: StageStatus,
    pub total_rows: i64,
    pub valid_rows: i64,
    pub success_rows: i64,
    pub failed_rows: i64,
    pub qc_passed_rows: i64,
    pub qc_failed_rows: i64,
    pub retry_count: i32,
    pub max_retry_count: i32,
    pub import_batch_no: Option<String>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportTaskDetail {
    pub fn new_pending(
        task_id: i64,
        table_type: TableType,
        file_name: String,
        file_path: Option<String>,
        max_retry_count: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            task_id,
            table_type,
            file_name,
            file_path,
            status: DetailStatus::Pending,
            parse_status: StageStatus::Pending,
            import_status: StageStatus::Pending,
            qc_status: StageStatus::Pending,
            total_rows: 0,
            valid_rows: 0,
            success_rows: 0,
            failed_rows: 0,
            qc_passed_rows: 0,
            qc_failed_rows: 0,
            retry_count: 0,
            max_retry_count,
            import_batch_no: None,
            error_message: None,
            error_detail: None,
            start_time: None,
            end_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn processed_rows(&self) -> i64 {
        self.success_rows + self.failed_rows
    }

    /// 重试次数是否已用尽
    pub fn retry_exhausted(&self) -> bool {
        self.retry_count >= self.max_retry_count
    }

    pub fn can_retry(&self) -> bool {
        self.status == DetailStatus::Failed && !self.retry_exhausted()
    }

    /// 标记失败（终态）
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = DetailStatus::Failed;
        self.error_message = Some(reason.into());
        self.end_time = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

/// 失败明细摘要（写入 task.error_detail，驱动仅重试失败子集）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDetailSummary {
    pub detail_id: i64,
    pub table_type: TableType,
    pub reason: String,
    pub failed_rows: i64,
    pub retryable: bool,
}

impl FailedDetailSummary {
    pub fn from_detail(detail: &ImportTaskDetail) -> Self {
        Self {
            detail_id: detail.id,
            table_type: detail.table_type,
            reason: detail
                .error_message
                .clone()
                .unwrap_or_else(|| "未知原因".to_string()),
            failed_rows: detail.failed_rows,
            retryable: !detail.retry_exhausted(),
        }
    }
}

// ==========================================
// 终态推导
// ==========================================

/// 由明细状态推导任务终态
///
/// # 返回
/// - None: 仍有明细未到终态
/// - COMPLETED: 全部 SUCCESS
/// - PARTIAL_SUCCESS: 至少一个 SUCCESS 且至少一个 FAILED
/// - FAILED: 全部 FAILED，或没有任何明细
pub fn derive_task_status(statuses: &[DetailStatus]) -> Option<TaskStatus> {
    if statuses.is_empty() {
        return Some(TaskStatus::Failed);
    }
    if !statuses.iter().all(|s| s.is_terminal()) {
        return None;
    }

    let success = statuses.iter().filter(|s| **s == DetailStatus::Success).count();
    let status = if success == statuses.len() {
        TaskStatus::Completed
    } else if success > 0 {
        TaskStatus::PartialSuccess
    } else {
        TaskStatus::Failed
    };
    Some(status)
}

/// 进度百分比 = Σ(success+failed) / Σ(total)
///
/// 总行数为 0 时：全部终态记 100，否则 0
pub fn compute_progress_percent(details: &[ImportTaskDetail], all_terminal: bool) -> i32 {
    let total: i64 = details.iter().map(|d| d.total_rows).sum();
    if total <= 0 {
        return if all_terminal { 100 } else { 0 };
    }
    let processed: i64 = details.iter().map(|d| d.processed_rows().min(d.total_rows)).sum();
    ((processed * 100) / total).clamp(0, 100) as i32
}

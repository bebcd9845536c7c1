// ==========================================
// 医院药品数据导入质控系统 - 导入任务仓储
// ==========================================
// 职责: import_task / import_task_detail 表的 CRUD
// 红线: Repository 不含业务逻辑，状态推导在领域层
// ==========================================

use crate::domain::task::{ImportTask, ImportTaskDetail};
use crate::domain::types::{DetailStatus, ImportType, StageStatus, TaskStatus};
use crate::repository::db_utils::{code_col, table_type_col};
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const TASK_COLUMNS: &str = r#"
    id, task_no, task_name, source_file_name, source_file_path, source_file_size,
    import_type, status, extract_status, import_status, qc_status,
    total_files, success_files, failed_files,
    total_records, success_records, failed_records, progress_percent,
    extract_start_time, extract_end_time, import_start_time, import_end_time,
    qc_start_time, qc_end_time,
    error_message, error_detail, created_by, created_at, updated_at
"#;

const DETAIL_COLUMNS: &str = r#"
    id, task_id, table_type, file_name, file_path,
    status, parse_status, import_status, qc_status,
    total_rows, valid_rows, success_rows, failed_rows, qc_passed_rows, qc_failed_rows,
    retry_count, max_retry_count, import_batch_no,
    error_message, error_detail, start_time, end_time, created_at, updated_at
"#;

// ==========================================
// ImportTaskRepository - 导入任务仓储
// ==========================================
pub struct ImportTaskRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ImportTaskRepository {
    /// 从已有连接创建仓储实例
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 获取数据库连接
    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ===== 任务 =====

    /// 新增任务，返回自增 id
    pub fn insert_task(&self, task: &ImportTask) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO import_task (
                task_no, task_name, source_file_name, source_file_path, source_file_size,
                import_type, status, extract_status, import_status, qc_status,
                progress_percent, created_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                task.task_no,
                task.task_name,
                task.source_file_name,
                task.source_file_path,
                task.source_file_size,
                task.import_type.code(),
                task.status.code(),
                task.extract_status.code(),
                task.import_status.code(),
                task.qc_status.code(),
                task.progress_percent,
                task.created_by,
                task.created_at,
                task.updated_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 全量更新任务
    pub fn update_task(&self, task: &ImportTask) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            r#"
            UPDATE import_task SET
                source_file_path = ?2, status = ?3,
                extract_status = ?4, import_status = ?5, qc_status = ?6,
                total_files = ?7, success_files = ?8, failed_files = ?9,
                total_records = ?10, success_records = ?11, failed_records = ?12,
                progress_percent = ?13,
                extract_start_time = ?14, extract_end_time = ?15,
                import_start_time = ?16, import_end_time = ?17,
                qc_start_time = ?18, qc_end_time = ?19,
                error_message = ?20, error_detail = ?21, updated_at = ?22
            WHERE id = ?1
            "#,
            params![
                task.id,
                task.source_file_path,
                task.status.code(),
                task.extract_status.code(),
                task.import_status.code(),
                task.qc_status.code(),
                task.total_files,
                task.success_files,
                task.failed_files,
                task.total_records,
                task.success_records,
                task.failed_records,
                task.progress_percent,
                task.extract_start_time,
                task.extract_end_time,
                task.import_start_time,
                task.import_end_time,
                task.qc_start_time,
                task.qc_end_time,
                task.error_message,
                task.error_detail,
                task.updated_at,
            ],
        )?;
        if updated == 0 {
            return Err(RepositoryError::not_found("ImportTask", task.id));
        }
        Ok(())
    }

    pub fn find_task(&self, task_id: i64) -> RepositoryResult<Option<ImportTask>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM import_task WHERE id = ?1", TASK_COLUMNS);
        let task = conn
            .query_row(&sql, params![task_id], map_task)
            .optional()?;
        Ok(task)
    }

    pub fn find_task_by_no(&self, task_no: &str) -> RepositoryResult<Option<ImportTask>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM import_task WHERE task_no = ?1", TASK_COLUMNS);
        let task = conn
            .query_row(&sql, params![task_no], map_task)
            .optional()?;
        Ok(task)
    }

    /// 查询未到终态的任务（重启后续跑）
    pub fn list_unfinished_tasks(&self) -> RepositoryResult<Vec<ImportTask>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_task WHERE status IN (?1, ?2, ?3) ORDER BY id",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(
                params![
                    TaskStatus::Extracting.code(),
                    TaskStatus::Importing.code(),
                    TaskStatus::QcChecking.code()
                ],
                map_task,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    // ===== 明细 =====

    /// 新增明细，返回自增 id
    pub fn insert_detail(&self, detail: &ImportTaskDetail) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        Ok(insert_detail_row(&conn, detail)?)
    }

    /// 一个事务内新增多个明细（任一失败全部回滚），按输入顺序返回 id
    pub fn insert_details(&self, details: &[ImportTaskDetail]) -> RepositoryResult<Vec<i64>> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        let mut ids = Vec::with_capacity(details.len());
        for detail in details {
            ids.push(insert_detail_row(&tx, detail)?);
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(ids)
    }

    /// 删除任务的全部明细（级联删除数据行、行错误与质控结果）
    pub fn delete_details(&self, task_id: i64) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        Ok(conn.execute(
            "DELETE FROM import_task_detail WHERE task_id = ?1",
            [task_id],
        )?)
    }

    /// 全量更新明细（每批次后写入计数）
    pub fn update_detail(&self, detail: &ImportTaskDetail) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            r#"
            UPDATE import_task_detail SET
                status = ?2, parse_status = ?3, import_status = ?4, qc_status = ?5,
                total_rows = ?6, valid_rows = ?7, success_rows = ?8, failed_rows = ?9,
                qc_passed_rows = ?10, qc_failed_rows = ?11,
                retry_count = ?12, import_batch_no = ?13,
                error_message = ?14, error_detail = ?15,
                start_time = ?16, end_time = ?17, updated_at = ?18
            WHERE id = ?1
            "#,
            params![
                detail.id,
                detail.status.code(),
                detail.parse_status.code(),
                detail.import_status.code(),
                detail.qc_status.code(),
                detail.total_rows,
                detail.valid_rows,
                detail.success_rows,
                detail.failed_rows,
                detail.qc_passed_rows,
                detail.qc_failed_rows,
                detail.retry_count,
                detail.import_batch_no,
                detail.error_message,
                detail.error_detail,
                detail.start_time,
                detail.end_time,
                detail.updated_at,
            ],
        )?;
        if updated == 0 {
            return Err(RepositoryError::not_found("ImportTaskDetail", detail.id));
        }
        Ok(())
    }

    pub fn find_detail(&self, detail_id: i64) -> RepositoryResult<Option<ImportTaskDetail>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_task_detail WHERE id = ?1",
            DETAIL_COLUMNS
        );
        let detail = conn
            .query_row(&sql, params![detail_id], map_detail)
            .optional()?;
        Ok(detail)
    }

    /// 按表类型顺序返回任务下全部明细
    pub fn list_details(&self, task_id: i64) -> RepositoryResult<Vec<ImportTaskDetail>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM import_task_detail WHERE task_id = ?1 ORDER BY id",
            DETAIL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut details = stmt
            .query_map(params![task_id], map_detail)?
            .collect::<Result<Vec<_>, _>>()?;
        details.sort_by_key(|d| d.table_type);
        Ok(details)
    }
}

fn insert_detail_row(conn: &Connection, detail: &ImportTaskDetail) -> rusqlite::Result<i64> {
    conn.execute(
        r#"
        INSERT INTO import_task_detail (
            task_id, table_type, file_name, file_path,
            status, parse_status, import_status, qc_status,
            max_retry_count, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            detail.task_id,
            detail.table_type.code(),
            detail.file_name,
            detail.file_path,
            detail.status.code(),
            detail.parse_status.code(),
            detail.import_status.code(),
            detail.qc_status.code(),
            detail.max_retry_count,
            detail.created_at,
            detail.updated_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_task(row: &Row) -> rusqlite::Result<ImportTask> {
    Ok(ImportTask {
        id: row.get(0)?,
        task_no: row.get(1)?,
        task_name: row.get(2)?,
        source_file_name: row.get(3)?,
        source_file_path: row.get(4)?,
        source_file_size: row.get(5)?,
        import_type: code_col(row, 6, ImportType::from_code)?,
        status: code_col(row, 7, TaskStatus::from_code)?,
        extract_status: code_col(row, 8, StageStatus::from_code)?,
        import_status: code_col(row, 9, StageStatus::from_code)?,
        qc_status: code_col(row, 10, StageStatus::from_code)?,
        total_files: row.get(11)?,
        success_files: row.get(12)?,
        failed_files: row.get(13)?,
        total_records: row.get(14)?,
        success_records: row.get(15)?,
        failed_records: row.get(16)?,
        progress_percent: row.get(17)?,
        extract_start_time: row.get(18)?,
        extract_end_time: row.get(19)?,
        import_start_time: row.get(20)?,
        import_end_time: row.get(21)?,
        qc_start_time: row.get(22)?,
        qc_end_time: row.get(23)?,
        error_message: row.get(24)?,
        error_detail: row.get(25)?,
        created_by: row.get(26)?,
        created_at: row.get(27)?,
        updated_at: row.get(28)?,
    })
}

fn map_detail(row: &Row) -> rusqlite::Result<ImportTaskDetail> {
    Ok(ImportTaskDetail {
        id: row.get(0)?,
        task_id: row.get(1)?,
        table_type: table_type_col(row, 2)?,
        file_name: row.get(3)?,
        file_path: row.get(4)?,
        status: code_col(row, 5, DetailStatus::from_code)?,
        parse_status: code_col(row, 6, StageStatus::from_code)?,
        import_status: code_col(row, 7, StageStatus::from_code)?,
        qc_status: code_col(row, 8, StageStatus::from_code)?,
        total_rows: row.get(9)?,
        valid_rows: row.get(10)?,
        success_rows: row.get(11)?,
        failed_rows: row.get(12)?,
        qc_passed_rows: row.get(13)?,
        qc_failed_rows: row.get(14)?,
        retry_count: row.get(15)?,
        max_retry_count: row.get(16)?,
        import_batch_no: row.get(17)?,
        error_message: row.get(18)?,
        error_detail: row.get(19)?,
        start_time: row.get(20)?,
        end_time: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, ensure_schema};
    use crate::domain::types::TableType;

    fn repo() -> ImportTaskRepository {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        ensure_schema(&conn).unwrap();
        ImportTaskRepository::from_connection(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_task_and_detail_round_trip() {
        let repo = repo();
        let mut task = ImportTask::new_pending(
            "IMP001".into(),
            "一月数据".into(),
            "jan.zip".into(),
            2048,
            ImportType::Archive,
            Some("u1".into()),
        );
        task.id = repo.insert_task(&task).unwrap();
        task.status = TaskStatus::Importing;
        task.progress_percent = 40;
        repo.update_task(&task).unwrap();

        let loaded = repo.find_task(task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Importing);
        assert_eq!(loaded.progress_percent, 40);
        assert_eq!(loaded.import_type, ImportType::Archive);
        assert_eq!(repo.list_unfinished_tasks().unwrap().len(), 1);

        for table in [TableType::DrugUsage, TableType::DrugCatalog] {
            let detail = ImportTaskDetail::new_pending(task.id, table, "f.csv".into(), None, 3);
            repo.insert_detail(&detail).unwrap();
        }
        let details = repo.list_details(task.id).unwrap();
        assert_eq!(details[0].table_type, TableType::DrugCatalog);
        assert_eq!(details[1].max_retry_count, 3);
    }

    #[test]
    fn test_insert_details_is_all_or_nothing() {
        let repo = repo();
        let task = ImportTask::new_pending(
            "IMP002".into(),
            "t".into(),
            "a.zip".into(),
            1,
            ImportType::Archive,
            None,
        );
        let task_id = repo.insert_task(&task).unwrap();

        let detail = |table| ImportTaskDetail::new_pending(task_id, table, "f.csv".into(), None, 3);
        // 同一任务同一表类型重复，整体回滚
        let result = repo.insert_details(&[
            detail(TableType::DrugCatalog),
            detail(TableType::DrugUsage),
            detail(TableType::DrugUsage),
        ]);
        assert!(result.is_err());
        assert!(repo.list_details(task_id).unwrap().is_empty());

        let ids = repo
            .insert_details(&[detail(TableType::DrugCatalog), detail(TableType::DrugUsage)])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(repo.delete_details(task_id).unwrap(), 2);
        assert!(repo.list_details(task_id).unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_task_is_not_found() {
        let repo = repo();
        let mut task = ImportTask::new_pending(
            "IMP404".into(),
            "t".into(),
            "a.csv".into(),
            1,
            ImportType::SingleFile,
            None,
        );
        task.id = 404;
        assert!(matches!(
            repo.update_task(&task),
            Err(RepositoryError::NotFound { .. })
        ));
    }
}

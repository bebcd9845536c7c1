// ==========================================
// 医院药品数据导入质控系统 - 业务数据表仓储
// ==========================================
// 职责: 五类数据表的批量写入、分页读取、跨表存在性查询；行错误记录
// 约束: 每批次一个事务，失败只回滚本批次
// ==========================================

use crate::domain::record::{ImportRow, RowRejection};
use crate::domain::types::TableType;
use crate::repository::db_utils::value_to_text;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// 数据行写入的归属信息
#[derive(Debug, Clone, Copy)]
pub struct RowOwner<'a> {
    pub task_id: i64,
    pub detail_id: i64,
    pub batch_no: &'a str,
}

// ==========================================
// TableDataRepository
// ==========================================
pub struct TableDataRepository {
    conn: Arc<Mutex<Connection>>,
}

impl TableDataRepository {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 批量写入（单事务）
    ///
    /// # 返回
    /// - Ok(usize): 写入行数
    /// - Err: 任一行失败则整批回滚
    pub fn insert_batch(
        &self,
        table_type: TableType,
        owner: RowOwner<'_>,
        rows: &[ImportRow],
    ) -> RepositoryResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let schema = table_type.schema();
        let column_names: Vec<&str> = schema.columns.iter().map(|c| c.name).collect();
        let placeholders: Vec<String> = (1..=column_names.len() + 4)
            .map(|i| format!("?{}", i))
            .collect();
        let sql = format!(
            "INSERT INTO {} (task_id, detail_id, batch_no, row_no, {}) VALUES ({})",
            table_type.table_name(),
            column_names.join(", "),
            placeholders.join(", ")
        );

        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                let mut values: Vec<Value> = vec![
                    Value::Integer(owner.task_id),
                    Value::Integer(owner.detail_id),
                    Value::Text(owner.batch_no.to_string()),
                    Value::Integer(row.row_number as i64),
                ];
                values.extend(column_names.iter().map(|name| match row.get(name) {
                    Some(v) => Value::Text(v.to_string()),
                    None => Value::Null,
                }));
                stmt.execute(params_from_iter(values.iter()))?;
            }
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        debug!(
            table = table_type.table_name(),
            batch_no = owner.batch_no,
            rows = rows.len(),
            "批次写入完成"
        );
        Ok(rows.len())
    }

    /// 记录行级错误
    pub fn record_row_errors(
        &self,
        owner: RowOwner<'_>,
        rejections: &[RowRejection],
    ) -> RepositoryResult<()> {
        if rejections.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO import_row_error (task_id, detail_id, batch_no, row_no, field_name, reason)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for r in rejections {
                stmt.execute(params![
                    owner.task_id,
                    owner.detail_id,
                    owner.batch_no,
                    r.row_number as i64,
                    r.field,
                    r.reason,
                ])?;
            }
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    /// 指定批次的失败行号
    pub fn failed_row_numbers(
        &self,
        detail_id: i64,
        batch_no: &str,
    ) -> RepositoryResult<HashSet<usize>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT row_no FROM import_row_error WHERE detail_id = ?1 AND batch_no = ?2",
        )?;
        let rows = stmt
            .query_map(params![detail_id, batch_no], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|r| r as usize).collect())
    }

    /// 指定批次的行错误
    pub fn list_row_errors(
        &self,
        detail_id: i64,
        batch_no: &str,
    ) -> RepositoryResult<Vec<RowRejection>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT row_no, field_name, reason FROM import_row_error
            WHERE detail_id = ?1 AND batch_no = ?2
            ORDER BY row_no, id
            "#,
        )?;
        let rows = stmt
            .query_map(params![detail_id, batch_no], |row| {
                Ok(RowRejection {
                    row_number: row.get::<_, i64>(0)? as usize,
                    field: row.get(1)?,
                    reason: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 已落库的行号
    pub fn persisted_row_numbers(
        &self,
        table_type: TableType,
        detail_id: i64,
    ) -> RepositoryResult<HashSet<usize>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT row_no FROM {} WHERE detail_id = ?1",
            table_type.table_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![detail_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|r| r as usize).collect())
    }

    pub fn count_rows(&self, table_type: TableType, detail_id: i64) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE detail_id = ?1",
            table_type.table_name()
        );
        let count = conn.query_row(&sql, params![detail_id], |row| row.get(0))?;
        Ok(count)
    }

    /// 分页读取已落库行（按 id 游标）
    ///
    /// # 返回
    /// - (下一页游标, 行)
    pub fn fetch_rows(
        &self,
        table_type: TableType,
        detail_id: i64,
        after_id: i64,
        limit: usize,
    ) -> RepositoryResult<(i64, Vec<ImportRow>)> {
        let schema = table_type.schema();
        let column_names: Vec<&str> = schema.columns.iter().map(|c| c.name).collect();
        let sql = format!(
            "SELECT id, row_no, {} FROM {} WHERE detail_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            column_names.join(", "),
            table_type.table_name()
        );

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut cursor = after_id;
        let rows = stmt
            .query_map(params![detail_id, after_id, limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let mut record = ImportRow::new(row.get::<_, i64>(1)? as usize);
                for (idx, name) in column_names.iter().enumerate() {
                    if let Some(v) = value_to_text(row.get::<_, Value>(idx + 2)?) {
                        record.values.insert(name.to_string(), v);
                    }
                }
                Ok((id, record))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut page = Vec::with_capacity(rows.len());
        for (id, record) in rows {
            cursor = cursor.max(id);
            page.push(record);
        }
        Ok((cursor, page))
    }

    /// 任务内某表某列的去重取值（跨表存在性校验）
    pub fn distinct_values(
        &self,
        task_id: i64,
        table_type: TableType,
        column: &str,
    ) -> RepositoryResult<HashSet<String>> {
        let schema = table_type.schema();
        let column = schema
            .column(column)
            .ok_or_else(|| RepositoryError::FieldValueError {
                field: column.to_string(),
                message: format!("{} 无此列", table_type.table_name()),
            })?
            .name;

        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE task_id = ?1 AND {col} IS NOT NULL",
            col = column,
            table = table_type.table_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map(params![task_id], |row| row.get::<_, Value>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values.into_iter().filter_map(value_to_text).collect())
    }
}

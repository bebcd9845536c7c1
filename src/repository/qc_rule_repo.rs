// ==========================================
// 医院药品数据导入质控系统 - 质控规则与结果仓储
// ==========================================
// 职责: qc_rule 读写（管理端已校验）；qc_finding 按评估顺序持久化
// ==========================================

use crate::domain::qc::{QcFinding, QcRule};
use crate::domain::types::{ErrorLevel, RuleCategory, RuleType};
use crate::repository::db_utils::{code_col, table_type_col};
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub struct QcRuleRepository {
    conn: Arc<Mutex<Connection>>,
}

impl QcRuleRepository {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ===== 规则 =====

    /// 按 rule_code 新增或覆盖
    pub fn upsert_rule(&self, rule: &QcRule) -> RepositoryResult<i64> {
        let threshold = rule
            .threshold_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO qc_rule (
                rule_code, rule_name, rule_type, rule_category, table_type, field_name,
                rule_expression, error_message, error_level, threshold_value, priority, enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(rule_code) DO UPDATE SET
                rule_name = excluded.rule_name,
                rule_type = excluded.rule_type,
                rule_category = excluded.rule_category,
                table_type = excluded.table_type,
                field_name = excluded.field_name,
                rule_expression = excluded.rule_expression,
                error_message = excluded.error_message,
                error_level = excluded.error_level,
                threshold_value = excluded.threshold_value,
                priority = excluded.priority,
                enabled = excluded.enabled
            "#,
            params![
                rule.rule_code,
                rule.rule_name,
                rule.rule_type.code(),
                rule.rule_category.code(),
                rule.table_type.map(|t| t.code()),
                rule.field_name,
                rule.rule_expression,
                rule.error_message,
                rule.error_level.code(),
                threshold,
                rule.priority,
                rule.enabled,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM qc_rule WHERE rule_code = ?1",
            params![rule.rule_code],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// 读取全部启用规则（排序由引擎快照负责）
    pub fn list_enabled_rules(&self) -> RepositoryResult<Vec<QcRule>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, rule_code, rule_name, rule_type, rule_category, table_type, field_name,
                   rule_expression, error_message, error_level, threshold_value, priority, enabled
            FROM qc_rule
            WHERE enabled = 1
            "#,
        )?;
        let rules = stmt
            .query_map([], map_rule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    // ===== 质控结果 =====

    /// 按给定顺序追加质控结果
    pub fn insert_findings(
        &self,
        task_id: i64,
        detail_id: Option<i64>,
        stage: RuleType,
        findings: &[QcFinding],
    ) -> RepositoryResult<()> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO qc_finding (
                    task_id, detail_id, stage, table_type, rule_code, error_level,
                    message, row_no, field_name
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for f in findings {
                stmt.execute(params![
                    task_id,
                    detail_id,
                    stage.code(),
                    f.table_type.code(),
                    f.rule_code,
                    f.level.code(),
                    f.message,
                    f.row_number.map(|r| r as i64),
                    f.field_name,
                ])?;
            }
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    /// 任务的全部质控结果（写入顺序即评估顺序）
    pub fn list_findings(&self, task_id: i64) -> RepositoryResult<Vec<QcFinding>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT rule_code, error_level, message, table_type, row_no, field_name
            FROM qc_finding
            WHERE task_id = ?1
            ORDER BY table_type, stage, row_no, id
            "#,
        )?;
        let findings = stmt
            .query_map(params![task_id], |row| {
                Ok(QcFinding {
                    rule_code: row.get(0)?,
                    level: code_col(row, 1, ErrorLevel::from_code)?,
                    message: row.get(2)?,
                    table_type: table_type_col(row, 3)?,
                    row_number: row.get::<_, Option<i64>>(4)?.map(|r| r as usize),
                    field_name: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(findings)
    }

    /// 删除明细在某阶段的结果；rows 为 Some 时仅删除这些行的行级结果
    pub fn delete_findings(
        &self,
        detail_id: i64,
        stage: RuleType,
        rows: Option<&HashSet<usize>>,
    ) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let deleted = match rows {
            None => conn.execute(
                "DELETE FROM qc_finding WHERE detail_id = ?1 AND stage = ?2",
                params![detail_id, stage.code()],
            )?,
            Some(rows) => {
                let mut stmt = conn.prepare(
                    "DELETE FROM qc_finding WHERE detail_id = ?1 AND stage = ?2 AND row_no = ?3",
                )?;
                let mut total = 0;
                for row in rows {
                    total += stmt.execute(params![detail_id, stage.code(), *row as i64])?;
                }
                total
            }
        };
        Ok(deleted)
    }

    /// 删除明细在某阶段的表级结果（row_no 为空）
    pub fn delete_table_findings(&self, detail_id: i64, stage: RuleType) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM qc_finding WHERE detail_id = ?1 AND stage = ?2 AND row_no IS NULL",
            params![detail_id, stage.code()],
        )?;
        Ok(deleted)
    }

    /// 明细某阶段的 error 级结果条数
    pub fn count_error_findings(&self, detail_id: i64, stage: RuleType) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM qc_finding WHERE detail_id = ?1 AND stage = ?2 AND error_level = ?3",
            params![detail_id, stage.code(), ErrorLevel::Error.code()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 明细某阶段出现 error 级行级结果的行数
    pub fn count_error_rows(&self, detail_id: i64, stage: RuleType) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            r#"
            SELECT COUNT(DISTINCT row_no) FROM qc_finding
            WHERE detail_id = ?1 AND stage = ?2 AND error_level = ?3 AND row_no IS NOT NULL
            "#,
            params![detail_id, stage.code(), ErrorLevel::Error.code()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_rule(row: &Row) -> rusqlite::Result<QcRule> {
    let table_type = match row.get::<_, Option<String>>(5)? {
        Some(_) => Some(table_type_col(row, 5)?),
        None => None,
    };
    let threshold_value = row
        .get::<_, Option<String>>(10)?
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(QcRule {
        id: row.get(0)?,
        rule_code: row.get(1)?,
        rule_name: row.get(2)?,
        rule_type: code_col(row, 3, RuleType::from_code)?,
        rule_category: code_col(row, 4, RuleCategory::from_code)?,
        table_type,
        field_name: row.get(6)?,
        rule_expression: row.get(7)?,
        error_message: row.get(8)?,
        error_level: code_col(row, 9, ErrorLevel::from_code)?,
        threshold_value,
        priority: row.get(11)?,
        enabled: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, ensure_schema};
    use crate::domain::types::TableType;
    use serde_json::json;

    fn repo() -> QcRuleRepository {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute(
            r#"INSERT INTO import_task (task_no, task_name, source_file_name, import_type, created_at, updated_at)
               VALUES ('IMP1', 't', 'a.zip', 2, datetime('now'), datetime('now'))"#,
            [],
        )
        .unwrap();
        QcRuleRepository::from_connection(Arc::new(Mutex::new(conn)))
    }

    fn rule(code: &str, enabled: bool) -> QcRule {
        QcRule {
            id: 0,
            rule_code: code.into(),
            rule_name: "数量为正".into(),
            rule_type: RuleType::PostImport,
            rule_category: RuleCategory::Field,
            table_type: Some(TableType::DrugUsage),
            field_name: Some("quantity".into()),
            rule_expression: "$value <= 0".into(),
            error_message: "第 {row} 行 {field} 非正数".into(),
            error_level: ErrorLevel::Error,
            threshold_value: Some(json!({"value": 0})),
            priority: 10,
            enabled,
        }
    }

    #[test]
    fn test_upsert_and_list_enabled() {
        let repo = repo();
        repo.upsert_rule(&rule("R1", true)).unwrap();
        repo.upsert_rule(&rule("R2", false)).unwrap();
        let mut updated = rule("R1", true);
        updated.priority = 1;
        repo.upsert_rule(&updated).unwrap();

        let rules = repo.list_enabled_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 1);
        assert_eq!(rules[0].table_type, Some(TableType::DrugUsage));
        assert_eq!(rules[0].threshold_value, Some(json!({"value": 0})));
    }

    #[test]
    fn test_findings_keep_order() {
        let repo = repo();
        let findings: Vec<QcFinding> = (1..=3)
            .map(|i| QcFinding {
                rule_code: format!("R{}", 4 - i),
                level: ErrorLevel::Warning,
                message: "m".into(),
                table_type: TableType::DrugUsage,
                row_number: Some(i),
                field_name: None,
            })
            .collect();
        repo.insert_findings(1, None, RuleType::PostImport, &findings)
            .unwrap();
        assert_eq!(repo.list_findings(1).unwrap(), findings);
    }

    #[test]
    fn test_findings_order_independent_of_insert_interleaving() {
        let repo = repo();
        let finding = |table_type, row: Option<usize>, code: &str| QcFinding {
            rule_code: code.into(),
            level: ErrorLevel::Warning,
            message: "m".into(),
            table_type,
            row_number: row,
            field_name: None,
        };
        // 并发导入时两个明细的批次交错写入
        repo.insert_findings(1, None, RuleType::PreImport, &[finding(TableType::DrugUsage, Some(2), "U")])
            .unwrap();
        repo.insert_findings(1, None, RuleType::PostImport, &[finding(TableType::DrugCatalog, Some(1), "C2")])
            .unwrap();
        repo.insert_findings(1, None, RuleType::PreImport, &[finding(TableType::DrugCatalog, Some(3), "C1")])
            .unwrap();
        repo.insert_findings(1, None, RuleType::PreImport, &[finding(TableType::DrugUsage, Some(1), "U")])
            .unwrap();

        let order: Vec<(String, Option<usize>)> = repo
            .list_findings(1)
            .unwrap()
            .into_iter()
            .map(|f| (f.rule_code, f.row_number))
            .collect();
        assert_eq!(
            order,
            vec![
                ("C1".to_string(), Some(3)),
                ("C2".to_string(), Some(1)),
                ("U".to_string(), Some(1)),
                ("U".to_string(), Some(2)),
            ]
        );
    }

    #[test]
    fn test_delete_findings_by_scope() {
        let repo = repo();
        {
            let conn = repo.get_conn().unwrap();
            conn.execute(
                r#"INSERT INTO import_task_detail (task_id, table_type, file_name, created_at, updated_at)
                   VALUES (1, 'DRUG_USAGE', 'u.csv', datetime('now'), datetime('now'))"#,
                [],
            )
            .unwrap();
        }
        let finding = |row: Option<usize>, level| QcFinding {
            rule_code: "R1".into(),
            level,
            message: "m".into(),
            table_type: TableType::DrugUsage,
            row_number: row,
            field_name: None,
        };
        repo.insert_findings(
            1,
            Some(1),
            RuleType::PreImport,
            &[
                finding(None, ErrorLevel::Warning),
                finding(Some(2), ErrorLevel::Error),
                finding(Some(2), ErrorLevel::Error),
                finding(Some(3), ErrorLevel::Error),
            ],
        )
        .unwrap();

        assert_eq!(repo.count_error_findings(1, RuleType::PreImport).unwrap(), 3);
        assert_eq!(repo.count_error_rows(1, RuleType::PreImport).unwrap(), 2);

        assert_eq!(repo.delete_table_findings(1, RuleType::PreImport).unwrap(), 1);
        let rows: HashSet<usize> = [2].into_iter().collect();
        assert_eq!(repo.delete_findings(1, RuleType::PreImport, Some(&rows)).unwrap(), 2);
        assert_eq!(repo.list_findings(1).unwrap().len(), 1);
    }
}

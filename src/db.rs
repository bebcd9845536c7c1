// ==========================================
// 医院药品数据导入质控系统 - SQLite 连接初始化与建表
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键 + busy_timeout）
// - 建表幂等：任务/明细/行错误/规则/质控结果/配置 + 五类数据表
// ==========================================

use crate::domain::table_schema::TableSchema;
use crate::domain::types::TableType;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 建表（幂等）
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CORE_SCHEMA)?;
    for table in TableType::ALL {
        conn.execute_batch(&data_table_ddl(table.schema()))?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 数据表 DDL（由表结构目录生成）
pub fn data_table_ddl(schema: &TableSchema) -> String {
    let table = schema.table_type.table_name();
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "task_id INTEGER NOT NULL REFERENCES import_task(id) ON DELETE CASCADE".to_string(),
        "detail_id INTEGER NOT NULL REFERENCES import_task_detail(id) ON DELETE CASCADE"
            .to_string(),
        "batch_no TEXT NOT NULL".to_string(),
        "row_no INTEGER NOT NULL".to_string(),
    ];
    for column in schema.columns {
        let not_null = if column.required { " NOT NULL" } else { "" };
        columns.push(format!("{} {}{}", column.name, column.kind.sql_type(), not_null));
    }
    columns.push("created_at TEXT NOT NULL DEFAULT (datetime('now'))".to_string());

    // 药品目录同一任务内 (机构, 药品编码) 唯一
    if schema.table_type == TableType::DrugCatalog {
        columns.push("UNIQUE (task_id, hospital_code, drug_code)".to_string());
    }

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n);\n\
         CREATE INDEX IF NOT EXISTS idx_{table}_detail_row ON {table}(detail_id, row_no);",
        columns.join(",\n    "),
        table = table
    );
    // 医院信息表无药品编码列
    if schema.column("drug_code").is_some() {
        ddl.push_str(&format!(
            "\nCREATE INDEX IF NOT EXISTS idx_{table}_task_drug ON {table}(task_id, drug_code);",
            table = table
        ));
    }
    ddl
}

const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS config_scope (
    scope_id TEXT PRIMARY KEY,
    scope_type TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(scope_type, scope_key)
);

INSERT OR IGNORE INTO config_scope (scope_id, scope_type, scope_key)
VALUES ('global', 'GLOBAL', 'global');

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL REFERENCES config_scope(scope_id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_id, key)
);

CREATE TABLE IF NOT EXISTS import_task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_no TEXT NOT NULL UNIQUE,
    task_name TEXT NOT NULL,
    source_file_name TEXT NOT NULL,
    source_file_path TEXT,
    source_file_size INTEGER NOT NULL DEFAULT 0,
    import_type INTEGER NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    extract_status INTEGER NOT NULL DEFAULT 0,
    import_status INTEGER NOT NULL DEFAULT 0,
    qc_status INTEGER NOT NULL DEFAULT 0,
    total_files INTEGER NOT NULL DEFAULT 0,
    success_files INTEGER NOT NULL DEFAULT 0,
    failed_files INTEGER NOT NULL DEFAULT 0,
    total_records INTEGER NOT NULL DEFAULT 0,
    success_records INTEGER NOT NULL DEFAULT 0,
    failed_records INTEGER NOT NULL DEFAULT 0,
    progress_percent INTEGER NOT NULL DEFAULT 0,
    extract_start_time TEXT,
    extract_end_time TEXT,
    import_start_time TEXT,
    import_end_time TEXT,
    qc_start_time TEXT,
    qc_end_time TEXT,
    error_message TEXT,
    error_detail TEXT,
    created_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS import_task_detail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES import_task(id) ON DELETE CASCADE,
    table_type TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_path TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    parse_status INTEGER NOT NULL DEFAULT 0,
    import_status INTEGER NOT NULL DEFAULT 0,
    qc_status INTEGER NOT NULL DEFAULT 0,
    total_rows INTEGER NOT NULL DEFAULT 0,
    valid_rows INTEGER NOT NULL DEFAULT 0,
    success_rows INTEGER NOT NULL DEFAULT 0,
    failed_rows INTEGER NOT NULL DEFAULT 0,
    qc_passed_rows INTEGER NOT NULL DEFAULT 0,
    qc_failed_rows INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retry_count INTEGER NOT NULL DEFAULT 3,
    import_batch_no TEXT,
    error_message TEXT,
    error_detail TEXT,
    start_time TEXT,
    end_time TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (task_id, table_type)
);

CREATE TABLE IF NOT EXISTS import_row_error (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES import_task(id) ON DELETE CASCADE,
    detail_id INTEGER NOT NULL REFERENCES import_task_detail(id) ON DELETE CASCADE,
    batch_no TEXT NOT NULL,
    row_no INTEGER NOT NULL,
    field_name TEXT,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_row_error_detail_batch ON import_row_error(detail_id, batch_no);

CREATE TABLE IF NOT EXISTS qc_rule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_code TEXT NOT NULL UNIQUE,
    rule_name TEXT NOT NULL,
    rule_type INTEGER NOT NULL,
    rule_category INTEGER NOT NULL,
    table_type TEXT,
    field_name TEXT,
    rule_expression TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_level INTEGER NOT NULL,
    threshold_value TEXT,
    priority INTEGER NOT NULL DEFAULT 100,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS qc_finding (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES import_task(id) ON DELETE CASCADE,
    detail_id INTEGER REFERENCES import_task_detail(id) ON DELETE CASCADE,
    stage INTEGER NOT NULL,
    table_type TEXT NOT NULL,
    rule_code TEXT NOT NULL,
    error_level INTEGER NOT NULL,
    message TEXT NOT NULL,
    row_no INTEGER,
    field_name TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_qc_finding_task ON qc_finding(task_id);
"#;

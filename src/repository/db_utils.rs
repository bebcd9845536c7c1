// ==========================================
// 医院药品数据导入质控系统 - 仓储公共工具
// ==========================================
// 职责: 整数状态码/表类型列的读取与校验
// ==========================================

use crate::domain::types::TableType;
use rusqlite::types::{Type, Value};
use rusqlite::Row;

/// 读取整数编码列并转换为枚举
pub fn code_col<T>(row: &Row, idx: usize, decode: fn(i32) -> Option<T>) -> rusqlite::Result<T> {
    let code: i32 = row.get(idx)?;
    decode(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("非法编码: {}", code).into(),
        )
    })
}

/// 读取表类型列
pub fn table_type_col(row: &Row, idx: usize) -> rusqlite::Result<TableType> {
    let code: String = row.get(idx)?;
    TableType::from_code(&code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("非法表类型: {}", code).into(),
        )
    })
}

/// 任意 SQLite 值转文本（NULL → None）
pub fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(v) => Some(v.to_string()),
        Value::Real(v) => Some(v.to_string()),
        Value::Text(v) => Some(v),
        Value::Blob(v) => Some(String::from_utf8_lossy(&v).into_owned()),
    }
}

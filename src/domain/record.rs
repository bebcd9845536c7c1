// ==========================================
// 医院药品数据导入质控系统 - 行记录
// ==========================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 原始行（表头 → 单元格文本），row_number 为文件内数据行号（从 1 开始）
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub row_number: usize,
    pub cells: HashMap<String, String>,
}

/// 映射后的行（规范列名 → 规范化值），空值不入 map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportRow {
    pub row_number: usize,
    pub values: HashMap<String, String>,
}

impl ImportRow {
    pub fn new(row_number: usize) -> Self {
        Self {
            row_number,
            values: HashMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(|v| v.as_str())
    }

    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.values.insert(field.to_string(), value.to_string());
        self
    }
}

/// 行级拒绝原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRejection {
    pub row_number: usize,
    pub field: Option<String>,
    pub reason: String,
}

// ==========================================
// 医院药品数据导入质控系统 - 质控规则与结果
// ==========================================

use crate::domain::types::{ErrorLevel, RuleCategory, RuleType, TableType};
use serde::{Deserialize, Serialize};

// ==========================================
// QcRule - 质控规则（管理端已校验，引擎只读）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QcRule {
    pub id: i64,
    pub rule_code: String,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub rule_category: RuleCategory,
    pub table_type: Option<TableType>, // None = 适用所有表
    pub field_name: Option<String>,
    pub rule_expression: String,
    pub error_message: String,
    pub error_level: ErrorLevel,
    pub threshold_value: Option<serde_json::Value>,
    pub priority: i32,
    pub enabled: bool,
}

impl QcRule {
    pub fn applies_to(&self, table_type: TableType) -> bool {
        self.table_type.map_or(true, |t| t == table_type)
    }

    /// 阈值主数值：threshold_value.value，或对象内唯一的数值字段，或本身为数值
    pub fn primary_threshold(&self) -> Option<f64> {
        let value = self.threshold_value.as_ref()?;
        if let Some(n) = value.as_f64() {
            return Some(n);
        }
        let obj = value.as_object()?;
        if let Some(n) = obj.get("value").and_then(|v| v.as_f64()) {
            return Some(n);
        }
        let mut numbers = obj.values().filter_map(|v| v.as_f64());
        match (numbers.next(), numbers.next()) {
            (Some(n), None) => Some(n),
            _ => None,
        }
    }

    /// 按键读取阈值
    pub fn threshold(&self, key: &str) -> Option<f64> {
        self.threshold_value
            .as_ref()?
            .as_object()?
            .get(key)?
            .as_f64()
    }
}

// ==========================================
// QcFinding - 质控发现
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QcFinding {
    pub rule_code: String,
    pub level: ErrorLevel,
    pub message: String,
    pub table_type: TableType,
    pub row_number: Option<usize>, // None = 表级
    pub field_name: Option<String>,
}

impl QcFinding {
    pub fn is_error(&self) -> bool {
        self.level == ErrorLevel::Error
    }
}

/// 规则配置错误（表达式非法等），跳过该规则并提交运营关注
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfigIssue {
    pub rule_code: String,
    pub message: String,
}

// ==========================================
// 医院药品数据导入质控系统 - 数据清洗器
// ==========================================
// 职责: TRIM / NULL 标准化 / 整数、小数、日期格式规范化
// ==========================================

use crate::domain::table_schema::ColumnKind;
use chrono::{Duration, NaiveDate, NaiveDateTime};

/// 视为空值的占位文本
const NULL_MARKERS: [&str; 5] = ["null", "n/a", "na", "-", "无"];

/// Excel 序列日期的合法范围（1900-01-01 .. 9999-12-31）
const EXCEL_SERIAL_MIN: f64 = 1.0;
const EXCEL_SERIAL_MAX: f64 = 2_958_465.0;

pub struct DataCleaner;

impl DataCleaner {
    /// 标准化 NULL 值（空白/占位符 → None）
    pub fn normalize_null(value: &str) -> Option<&str> {
        let trimmed = value.trim();
        if trimmed.is_empty() || NULL_MARKERS.iter().any(|m| trimmed.eq_ignore_ascii_case(m)) {
            None
        } else {
            Some(trimmed)
        }
    }

    /// 按列类型规范化，格式非法返回 Err(说明)
    pub fn normalize(value: &str, kind: ColumnKind) -> Result<String, String> {
        match kind {
            ColumnKind::Text => Ok(value.to_string()),
            ColumnKind::Integer => Self::normalize_integer(value)
                .map(|v| v.to_string())
                .ok_or_else(|| format!("期望整数，实际 {}", value)),
            ColumnKind::Decimal => Self::parse_decimal(value)
                .map(|v| v.to_string())
                .ok_or_else(|| format!("期望数值，实际 {}", value)),
            ColumnKind::Date => Self::normalize_date(value)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok_or_else(|| format!("日期格式错误，实际 {}", value)),
        }
    }

    /// 解析数值（允许千分位逗号）
    pub fn parse_decimal(value: &str) -> Option<f64> {
        let cleaned: String = value.trim().chars().filter(|c| *c != ',').collect();
        cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// 解析整数（Excel 中的 "12.0" 视为 12）
    pub fn normalize_integer(value: &str) -> Option<i64> {
        let cleaned: String = value.trim().chars().filter(|c| *c != ',').collect();
        if let Ok(v) = cleaned.parse::<i64>() {
            return Some(v);
        }
        let f = cleaned.parse::<f64>().ok()?;
        if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
            Some(f as i64)
        } else {
            None
        }
    }

    /// 解析日期（YYYY-MM-DD / YYYY/MM/DD / YYYYMMDD / 带时间 / Excel 序列号）
    pub fn normalize_date(value: &str) -> Option<NaiveDate> {
        let value = value.trim();
        for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"] {
            if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
                return Some(d);
            }
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
                return Some(dt.date());
            }
        }

        let serial = value.parse::<f64>().ok()?;
        if !(EXCEL_SERIAL_MIN..=EXCEL_SERIAL_MAX).contains(&serial) {
            return None;
        }
        // Excel 1900 日期系统以 1899-12-30 为 0 点
        let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
        base.checked_add_signed(Duration::days(serial.trunc() as i64))
    }
}

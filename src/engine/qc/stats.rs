// ==========================================
// 医院药品数据导入质控系统 - 表级聚合统计与跨表查找
// ==========================================
// 职责: 为全局规则提供 row_count / null_count / duplicate_count
//       为逻辑规则提供同任务内的跨表存在性查找
// ==========================================

use crate::domain::record::ImportRow;
use crate::domain::types::TableType;
use std::collections::{HashMap, HashSet};

/// 表级聚合（流式累积，不保留行）
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    row_count: usize,
    non_null: HashMap<String, usize>,
    // 仅跟踪被 duplicate_count 引用的列
    distinct: HashMap<String, HashSet<String>>,
}

impl TableStats {
    pub fn new(duplicate_columns: impl IntoIterator<Item = String>) -> Self {
        Self {
            row_count: 0,
            non_null: HashMap::new(),
            distinct: duplicate_columns
                .into_iter()
                .map(|c| (c, HashSet::new()))
                .collect(),
        }
    }

    pub fn observe(&mut self, row: &ImportRow) {
        self.row_count += 1;
        for (column, value) in &row.values {
            *self.non_null.entry(column.clone()).or_insert(0) += 1;
            if let Some(set) = self.distinct.get_mut(column) {
                set.insert(value.clone());
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn null_count(&self, column: &str) -> usize {
        self.row_count
            .saturating_sub(self.non_null.get(column).copied().unwrap_or(0))
    }

    pub fn null_rate(&self, column: &str) -> f64 {
        if self.row_count == 0 {
            0.0
        } else {
            self.null_count(column) as f64 / self.row_count as f64
        }
    }

    /// 重复值个数 = 非空值个数 - 去重后个数；未跟踪的列返回 0
    pub fn duplicate_count(&self, column: &str) -> usize {
        match self.distinct.get(column) {
            Some(set) => self
                .non_null
                .get(column)
                .copied()
                .unwrap_or(0)
                .saturating_sub(set.len()),
            None => 0,
        }
    }
}

/// 跨表存在性查找（同一任务内）
pub trait CrossTableLookup: Send + Sync {
    fn exists(&self, table_type: TableType, column: &str, value: &str) -> bool;
}

/// 无跨表数据
pub struct NoLookup;

impl CrossTableLookup for NoLookup {
    fn exists(&self, _table_type: TableType, _column: &str, _value: &str) -> bool {
        false
    }
}

/// 预加载的去重取值（评估期间不访问数据库）
#[derive(Debug, Default)]
pub struct PreloadedLookup {
    values: HashMap<(TableType, String), HashSet<String>>,
}

impl PreloadedLookup {
    pub fn insert(&mut self, table_type: TableType, column: &str, values: HashSet<String>) {
        self.values.insert((table_type, column.to_string()), values);
    }
}

impl CrossTableLookup for PreloadedLookup {
    fn exists(&self, table_type: TableType, column: &str, value: &str) -> bool {
        self.values
            .get(&(table_type, column.to_string()))
            .map_or(false, |set| set.contains(value))
    }
}

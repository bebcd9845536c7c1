// ==========================================
// 医院药品数据导入质控系统 - 质控规则引擎
// ==========================================
// 职责: 规则快照（启用规则按 priority、rule_code 升序）+ 行级/表级评估
// 红线: 同一快照 + 同一数据 → 相同顺序的结果；不短路，所有规则均评估
// 配置错误: 表达式非法的规则被跳过并记录 RuleConfigIssue，不影响其他规则
// ==========================================

use crate::domain::qc::{QcFinding, QcRule, RuleConfigIssue};
use crate::domain::record::ImportRow;
use crate::domain::types::{RuleCategory, RuleType, TableType};
use crate::engine::qc::error::{QcError, QcResult};
use crate::engine::qc::expression::{EvalContext, Expr};
use crate::engine::qc::stats::{CrossTableLookup, TableStats};
use std::collections::HashSet;
use tracing::{debug, warn};

/// 已编译规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: QcRule,
    expr: Expr,
}

impl CompiledRule {
    pub fn is_global(&self) -> bool {
        self.rule.rule_category == RuleCategory::Global
    }
}

// ==========================================
// QcRuleEngine
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct QcRuleEngine {
    rules: Vec<CompiledRule>,
    issues: Vec<RuleConfigIssue>,
}

impl QcRuleEngine {
    /// 建立规则快照
    pub fn new(rules: Vec<QcRule>) -> Self {
        let mut enabled: Vec<QcRule> = rules.into_iter().filter(|r| r.enabled).collect();
        enabled.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_code.cmp(&b.rule_code))
        });

        let mut engine = Self::default();
        for rule in enabled {
            match compile(&rule) {
                Ok(expr) => engine.rules.push(CompiledRule { rule, expr }),
                Err(e) => {
                    warn!(rule_code = %rule.rule_code, error = %e, "规则配置错误，已跳过");
                    engine.issues.push(RuleConfigIssue {
                        rule_code: rule.rule_code.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        debug!(
            rules = engine.rules.len(),
            issues = engine.issues.len(),
            "规则快照已建立"
        );
        engine
    }

    /// 编译失败的规则
    pub fn issues(&self) -> &[RuleConfigIssue] {
        &self.issues
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn rules_for(
        &self,
        stage: RuleType,
        table_type: TableType,
        global: bool,
    ) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(move |r| {
            r.rule.rule_type == stage && r.rule.applies_to(table_type) && r.is_global() == global
        })
    }

    pub fn has_row_rules(&self, stage: RuleType, table_type: TableType) -> bool {
        self.rules_for(stage, table_type, false).next().is_some()
    }

    pub fn has_global_rules(&self, stage: RuleType, table_type: TableType) -> bool {
        self.rules_for(stage, table_type, true).next().is_some()
    }

    /// 全局规则中 duplicate_count 引用的列（统计时需要跟踪去重集合）
    pub fn duplicate_columns(&self, stage: RuleType, table_type: TableType) -> HashSet<String> {
        self.rules_for(stage, table_type, true)
            .flat_map(|r| r.expr.duplicate_columns())
            .map(str::to_string)
            .collect()
    }

    /// 行级规则中 exists_in 引用的 (表, 列)
    pub fn cross_table_refs(
        &self,
        stage: RuleType,
        table_type: TableType,
    ) -> HashSet<(TableType, String)> {
        self.rules
            .iter()
            .filter(|r| r.rule.rule_type == stage && r.rule.applies_to(table_type))
            .flat_map(|r| r.expr.cross_table_refs())
            .map(|(t, c)| (t, c.to_string()))
            .collect()
    }

    /// 行级评估（字段/逻辑规则）
    pub fn evaluate_row(
        &self,
        stage: RuleType,
        table_type: TableType,
        row: &ImportRow,
        lookup: &dyn CrossTableLookup,
    ) -> Vec<QcFinding> {
        self.rules_for(stage, table_type, false)
            .filter_map(|compiled| {
                let ctx = EvalContext {
                    rule: &compiled.rule,
                    row: Some(row),
                    stats: None,
                    lookup,
                };
                compiled
                    .expr
                    .eval(&ctx)
                    .truthy()
                    .then(|| finding(&compiled.rule, table_type, Some(row)))
            })
            .collect()
    }

    /// 表级评估（全局规则，基于聚合统计）
    pub fn evaluate_table(
        &self,
        stage: RuleType,
        table_type: TableType,
        stats: &TableStats,
        lookup: &dyn CrossTableLookup,
    ) -> Vec<QcFinding> {
        self.rules_for(stage, table_type, true)
            .filter_map(|compiled| {
                let ctx = EvalContext {
                    rule: &compiled.rule,
                    row: None,
                    stats: Some(stats),
                    lookup,
                };
                compiled
                    .expr
                    .eval(&ctx)
                    .truthy()
                    .then(|| finding(&compiled.rule, table_type, None))
            })
            .collect()
    }
}

fn compile(rule: &QcRule) -> QcResult<Expr> {
    let expr = Expr::parse(&rule.rule_expression)?;
    let global = rule.rule_category == RuleCategory::Global;

    if global && expr.uses_row() {
        return Err(QcError::InvalidScope(
            "全局规则不能引用行字段或 $value".to_string(),
        ));
    }
    if !global && expr.uses_aggregate() {
        return Err(QcError::InvalidScope("聚合函数仅可用于全局规则".to_string()));
    }
    // 导入前其他明细可能尚未落库
    if rule.rule_type == RuleType::PreImport && !expr.cross_table_refs().is_empty() {
        return Err(QcError::InvalidScope(
            "导入前规则不能使用 exists_in 跨表引用".to_string(),
        ));
    }

    let mut uses_value = false;
    expr.visit(&mut |e| uses_value |= matches!(e, Expr::FieldValue));
    if uses_value && rule.field_name.is_none() {
        return Err(QcError::InvalidScope("$value 需要配置 field_name".to_string()));
    }

    if let Some(table_type) = rule.table_type {
        let schema = table_type.schema();
        let columns = expr
            .referenced_columns()
            .into_iter()
            .chain(rule.field_name.as_deref());
        for column in columns {
            if schema.column(column).is_none() {
                return Err(QcError::UnknownColumn {
                    table: table_type.code().to_string(),
                    column: column.to_string(),
                });
            }
        }
    }
    Ok(expr)
}

fn finding(rule: &QcRule, table_type: TableType, row: Option<&ImportRow>) -> QcFinding {
    QcFinding {
        rule_code: rule.rule_code.clone(),
        level: rule.error_level,
        message: render_message(rule, table_type, row),
        table_type,
        row_number: row.map(|r| r.row_number),
        field_name: rule.field_name.clone(),
    }
}

/// 渲染消息模板：{field} {value} {row} {table} {rule} {threshold}
///
/// 单遍扫描，替换结果中的花括号不会被再次展开
pub fn render_message(rule: &QcRule, table_type: TableType, row: Option<&ImportRow>) -> String {
    let template = if rule.error_message.trim().is_empty() {
        "规则 {rule} 未通过"
    } else {
        rule.error_message.as_str()
    };

    let field = rule.field_name.as_deref().unwrap_or("");
    let value = row
        .zip(rule.field_name.as_deref())
        .and_then(|(r, f)| r.get(f))
        .unwrap_or("");

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let replacement = match &after[..end] {
            "field" => Some(field.to_string()),
            "value" => Some(value.to_string()),
            "row" => Some(row.map(|r| r.row_number.to_string()).unwrap_or_default()),
            "table" => Some(table_type.display_name().to_string()),
            "rule" => Some(rule.rule_code.clone()),
            "threshold" => Some(
                rule.primary_threshold()
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
            ),
            _ => None,
        };
        match replacement {
            Some(text) => out.push_str(&text),
            None => out.push_str(&rest[start..start + end + 2]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ErrorLevel;
    use crate::engine::qc::stats::NoLookup;
    use serde_json::json;

    fn rule(
        code: &str,
        priority: i32,
        category: RuleCategory,
        field: Option<&str>,
        expression: &str,
    ) -> QcRule {
        QcRule {
            id: 0,
            rule_code: code.into(),
            rule_name: code.into(),
            rule_type: RuleType::PostImport,
            rule_category: category,
            table_type: Some(TableType::DrugUsage),
            field_name: field.map(String::from),
            rule_expression: expression.into(),
            error_message: "{table} 第 {row} 行 {field}={value} 违反 {rule}".into(),
            error_level: ErrorLevel::Warning,
            threshold_value: Some(json!({"value": 0.1})),
            priority,
            enabled: true,
        }
    }

    fn sample_rules() -> Vec<QcRule> {
        vec![
            rule("R_B", 2, RuleCategory::Field, Some("quantity"), "$value <= 0"),
            rule("R_A", 2, RuleCategory::Field, Some("quantity"), "num($value) < 1"),
            rule("R_0", 1, RuleCategory::Logic, None, "is_null(department)"),
            rule("R_G", 1, RuleCategory::Global, None, "null_rate(department) > $threshold"),
        ]
    }

    #[test]
    fn test_evaluation_order_is_deterministic() {
        let row = ImportRow::new(5).with("quantity", "0");

        let mut reversed = sample_rules();
        reversed.reverse();
        let a = QcRuleEngine::new(sample_rules());
        let b = QcRuleEngine::new(reversed);

        let fa = a.evaluate_row(RuleType::PostImport, TableType::DrugUsage, &row, &NoLookup);
        let fb = b.evaluate_row(RuleType::PostImport, TableType::DrugUsage, &row, &NoLookup);
        assert_eq!(fa, fb);

        // 不短路：三条行级规则全部命中，按 (priority, rule_code) 排序
        let codes: Vec<&str> = fa.iter().map(|f| f.rule_code.as_str()).collect();
        assert_eq!(codes, vec!["R_0", "R_A", "R_B"]);
        assert_eq!(fa[1].message, "药品使用 第 5 行 quantity=0 违反 R_A");
    }

    #[test]
    fn test_global_rule_on_stats() {
        let engine = QcRuleEngine::new(sample_rules());
        let mut stats = TableStats::default();
        stats.observe(&ImportRow::new(1).with("department", "内科"));
        stats.observe(&ImportRow::new(2));

        let findings =
            engine.evaluate_table(RuleType::PostImport, TableType::DrugUsage, &stats, &NoLookup);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_code, "R_G");
        assert_eq!(findings[0].row_number, None);

        // 其他表不适用
        assert!(engine
            .evaluate_table(RuleType::PostImport, TableType::DrugCatalog, &stats, &NoLookup)
            .is_empty());
    }

    #[test]
    fn test_malformed_rules_are_skipped() {
        let mut rules = sample_rules();
        rules.push(rule("BAD_SYNTAX", 0, RuleCategory::Field, Some("quantity"), "$value >"));
        rules.push(rule("BAD_SCOPE", 0, RuleCategory::Global, None, "quantity > 1"));
        rules.push(rule("BAD_AGG", 0, RuleCategory::Field, None, "row_count() > 1"));
        rules.push(rule("BAD_COLUMN", 0, RuleCategory::Field, None, "weight > 1"));
        rules.push(rule("NO_FIELD", 0, RuleCategory::Field, None, "$value > 1"));
        let mut disabled = rule("OFF", 0, RuleCategory::Field, None, "???");
        disabled.enabled = false;
        rules.push(disabled);

        let engine = QcRuleEngine::new(rules);
        let codes: Vec<&str> = engine.issues().iter().map(|i| i.rule_code.as_str()).collect();
        assert_eq!(codes, vec!["BAD_AGG", "BAD_COLUMN", "BAD_SCOPE", "BAD_SYNTAX", "NO_FIELD"]);
        assert_eq!(engine.rule_count(), 4);
    }

    #[test]
    fn test_pre_import_rule_cannot_reference_other_tables() {
        let mut pre = rule(
            "PRE_XREF",
            0,
            RuleCategory::Logic,
            None,
            "not exists_in('DRUG_CATALOG', 'drug_code', drug_code)",
        );
        pre.rule_type = RuleType::PreImport;
        let mut post = pre.clone();
        post.rule_code = "POST_XREF".into();
        post.rule_type = RuleType::PostImport;

        let engine = QcRuleEngine::new(vec![pre, post]);
        assert_eq!(engine.rule_count(), 1);
        assert_eq!(engine.issues().len(), 1);
        assert_eq!(engine.issues()[0].rule_code, "PRE_XREF");
        assert!(engine.issues()[0].message.contains("exists_in"));
    }

    #[test]
    fn test_render_message_single_pass() {
        let mut r = rule("R1", 1, RuleCategory::Field, Some("drug_code"), "true");
        r.error_message = "{value} 阈值 {threshold} {unknown} {".into();
        let row = ImportRow::new(1).with("drug_code", "{row}");
        assert_eq!(
            render_message(&r, TableType::DrugUsage, Some(&row)),
            "{row} 阈值 0.1 {unknown} {"
        );
    }
}

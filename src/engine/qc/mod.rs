// ==========================================
// 医院药品数据导入质控系统 - 质控子系统
// ==========================================

pub mod error;
pub mod expression;
pub mod qc_rule_engine;
pub mod stats;

pub use error::{QcError, QcResult};
pub use expression::{EvalContext, Expr, Value};
pub use qc_rule_engine::{render_message, CompiledRule, QcRuleEngine};
pub use stats::{CrossTableLookup, NoLookup, PreloadedLookup, TableStats};

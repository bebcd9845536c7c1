// ==========================================
// 医院药品数据导入质控系统 - 质控规则配置错误
// ==========================================

use thiserror::Error;

/// 规则表达式编译错误（只影响该条规则）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QcError {
    #[error("表达式语法错误 (位置 {pos}): {message}")]
    Syntax { pos: usize, message: String },

    #[error("未知函数: {0}")]
    UnknownFunction(String),

    #[error("函数 {func} 参数个数错误: 期望 {expected}，实际 {actual}")]
    Arity {
        func: String,
        expected: usize,
        actual: usize,
    },

    #[error("函数 {func} 的第 {index} 个参数必须为字符串常量")]
    LiteralArgument { func: String, index: usize },

    #[error("未知表类型: {0}")]
    UnknownTable(String),

    #[error("表 {table} 无列 {column}")]
    UnknownColumn { table: String, column: String },

    #[error("规则作用域错误: {0}")]
    InvalidScope(String),
}

pub type QcResult<T> = Result<T, QcError>;

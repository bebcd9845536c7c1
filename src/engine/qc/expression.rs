// ==========================================
// 医院药品数据导入质控系统 - 规则表达式（沙箱谓词求值器）
// ==========================================
// 语法: 字面量 / 列名 / $value / $threshold / 比较 / and or not / 括号 / 白名单函数
// 语义: 两侧均可解析为数值时按数值比较，否则按字符串比较；
//       null 只参与 == / != 比较，其余比较一律为 false
// 结果: true = 违规
// ==========================================

use crate::domain::qc::QcRule;
use crate::domain::record::ImportRow;
use crate::domain::types::TableType;
use crate::engine::qc::error::{QcError, QcResult};
use crate::engine::qc::stats::{CrossTableLookup, TableStats};
use crate::importer::data_cleaner::DataCleaner;
use std::cmp::Ordering;

// ==========================================
// 值
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Value::Bool(_) | Value::Null => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// 表级聚合函数（仅全局规则可用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    RowCount,
    NullRate,
    NullCount,
    DuplicateCount,
}

/// 行级标量函数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFn {
    IsNull,
    IsBlank,
    Len,
    Num,
    MatchesDate,
}

// ==========================================
// 语法树
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    FieldValue, // $value
    Threshold,  // $threshold
    ThresholdKey(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Scalar(ScalarFn, Box<Expr>),
    Aggregate(Aggregate, Option<String>),
    ExistsIn(TableType, String, Box<Expr>),
}

/// 求值上下文
pub struct EvalContext<'a> {
    pub rule: &'a QcRule,
    pub row: Option<&'a ImportRow>,
    pub stats: Option<&'a TableStats>,
    pub lookup: &'a dyn CrossTableLookup,
}

impl EvalContext<'_> {
    /// 规则 field_name 在当前行的取值
    pub fn field_value(&self) -> Option<&str> {
        let field = self.rule.field_name.as_deref()?;
        self.row?.get(field)
    }
}

impl Expr {
    /// 解析表达式
    pub fn parse(src: &str) -> QcResult<Expr> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: src.len(),
        };
        let expr = parser.parse_or()?;
        if let Some((pos, token)) = parser.tokens.get(parser.pos) {
            return Err(QcError::Syntax {
                pos: *pos,
                message: format!("多余的符号 {:?}", token),
            });
        }
        Ok(expr)
    }

    /// 先序遍历
    pub fn visit<'e>(&'e self, f: &mut impl FnMut(&'e Expr)) {
        f(self);
        match self {
            Expr::Neg(e) | Expr::Not(e) | Expr::Scalar(_, e) | Expr::ExistsIn(_, _, e) => {
                e.visit(f)
            }
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
                l.visit(f);
                r.visit(f);
            }
            Expr::Literal(_)
            | Expr::Column(_)
            | Expr::FieldValue
            | Expr::Threshold
            | Expr::ThresholdKey(_)
            | Expr::Aggregate(_, _) => {}
        }
    }

    pub fn uses_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Aggregate(_, _)));
        found
    }

    /// 是否引用当前行（列名 / $value）
    pub fn uses_row(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Column(_) | Expr::FieldValue));
        found
    }

    /// 引用的列名（含聚合参数）
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.visit(&mut |e| match e {
            Expr::Column(c) | Expr::Aggregate(_, Some(c)) => columns.push(c.as_str()),
            _ => {}
        });
        columns
    }

    /// duplicate_count 引用的列
    pub fn duplicate_columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Aggregate(Aggregate::DuplicateCount, Some(c)) = e {
                columns.push(c.as_str());
            }
        });
        columns
    }

    /// exists_in 引用的 (表, 列)
    pub fn cross_table_refs(&self) -> Vec<(TableType, &str)> {
        let mut refs = Vec::new();
        self.visit(&mut |e| {
            if let Expr::ExistsIn(t, c, _) = e {
                refs.push((*t, c.as_str()));
            }
        });
        refs
    }

    /// 求值（总是成功；缺失值按 null 处理）
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Column(name) => ctx
                .row
                .and_then(|r| r.get(name))
                .map_or(Value::Null, |v| Value::Text(v.to_string())),
            Expr::FieldValue => ctx
                .field_value()
                .map_or(Value::Null, |v| Value::Text(v.to_string())),
            Expr::Threshold => ctx.rule.primary_threshold().map_or(Value::Null, Value::Number),
            Expr::ThresholdKey(key) => ctx.rule.threshold(key).map_or(Value::Null, Value::Number),
            Expr::Neg(e) => e.eval(ctx).as_number().map_or(Value::Null, |n| Value::Number(-n)),
            Expr::Not(e) => Value::Bool(!e.eval(ctx).truthy()),
            Expr::And(l, r) => Value::Bool(l.eval(ctx).truthy() && r.eval(ctx).truthy()),
            Expr::Or(l, r) => Value::Bool(l.eval(ctx).truthy() || r.eval(ctx).truthy()),
            Expr::Compare(op, l, r) => Value::Bool(compare(*op, &l.eval(ctx), &r.eval(ctx))),
            Expr::Scalar(func, arg) => eval_scalar(*func, arg.eval(ctx)),
            Expr::Aggregate(agg, column) => {
                let Some(stats) = ctx.stats else {
                    return Value::Null;
                };
                let column = column.as_deref().unwrap_or_default();
                let n = match agg {
                    Aggregate::RowCount => stats.row_count() as f64,
                    Aggregate::NullRate => stats.null_rate(column),
                    Aggregate::NullCount => stats.null_count(column) as f64,
                    Aggregate::DuplicateCount => stats.duplicate_count(column) as f64,
                };
                Value::Number(n)
            }
            Expr::ExistsIn(table, column, arg) => match arg.eval(ctx).as_text() {
                Some(v) => Value::Bool(ctx.lookup.exists(*table, column, &v)),
                None => Value::Bool(false),
            },
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    if *l == Value::Null || *r == Value::Null {
        let both = *l == Value::Null && *r == Value::Null;
        return match op {
            CmpOp::Eq => both,
            CmpOp::Ne => !both,
            _ => false,
        };
    }

    let ordering = match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => match (l, r) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => l.as_text().cmp(&r.as_text()),
        },
    };

    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    }
}

fn eval_scalar(func: ScalarFn, arg: Value) -> Value {
    match func {
        ScalarFn::IsNull => Value::Bool(arg == Value::Null),
        ScalarFn::IsBlank => Value::Bool(match &arg {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }),
        ScalarFn::Len => Value::Number(arg.as_text().map_or(0, |s| s.chars().count()) as f64),
        ScalarFn::Num => arg.as_number().map_or(Value::Null, Value::Number),
        ScalarFn::MatchesDate => Value::Bool(
            arg.as_text()
                .map_or(false, |s| DataCleaner::normalize_date(&s).is_some()),
        ),
    }
}

// ==========================================
// 词法
// ==========================================
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Var(String),
    LParen,
    RParen,
    Comma,
    Minus,
    Op(CmpOp),
    AndOp,
    OrOp,
    NotOp,
}

fn tokenize(src: &str) -> QcResult<Vec<(usize, Token)>> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |pos: usize, message: &str| QcError::Syntax {
        pos,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((pos, Token::Comma));
                i += 1;
            }
            '-' => {
                tokens.push((pos, Token::Minus));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((pos, Token::Op(CmpOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((pos, Token::Op(CmpOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((pos, Token::NotOp));
                i += 1;
            }
            '<' | '>' => {
                let (op, width) = match (c, next) {
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    _ => (CmpOp::Gt, 1),
                };
                tokens.push((pos, Token::Op(op)));
                i += width;
            }
            '&' if next == Some('&') => {
                tokens.push((pos, Token::AndOp));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((pos, Token::OrOp));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    let Some((_, ch)) = chars.get(i).copied() else {
                        return Err(syntax(pos, "字符串未闭合"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some((_, escaped)) = chars.get(i).copied() else {
                                return Err(syntax(pos, "字符串未闭合"));
                            };
                            value.push(escaped);
                            i += 1;
                        }
                        ch if ch == quote => break,
                        ch => value.push(ch),
                    }
                }
                tokens.push((pos, Token::Str(value)));
            }
            c if c.is_ascii_digit() || (c == '.' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(pos, &format!("非法数字 {}", text)))?;
                tokens.push((pos, Token::Number(n)));
            }
            '$' => {
                let start = i + 1;
                i += 1;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((pos, Token::Var(name.to_lowercase())));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.to_lowercase().as_str() {
                    "and" => Token::AndOp,
                    "or" => Token::OrOp,
                    "not" => Token::NotOp,
                    _ => Token::Ident(word),
                };
                tokens.push((pos, token));
            }
            other => return Err(syntax(pos, &format!("非法字符 {}", other))),
        }
    }
    Ok(tokens)
}

// ==========================================
// 语法（递归下降）
// ==========================================
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> QcError {
        QcError::Syntax {
            pos: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> QcResult<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            _ => Err(self.error(format!("期望 {:?}", expected))),
        }
    }

    fn parse_or(&mut self) -> QcResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOp) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> QcResult<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::AndOp) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> QcResult<Expr> {
        if self.peek() == Some(&Token::NotOp) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> QcResult<Expr> {
        let left = self.parse_unary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_unary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> QcResult<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> QcResult<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Text(s))),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Var(name)) => match name.as_str() {
                "value" => Ok(Expr::FieldValue),
                "threshold" => Ok(Expr::Threshold),
                _ => Err(self.error(format!("未知变量 ${}", name))),
            },
            Some(Token::Ident(word)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.parse_args()?;
                    return build_call(&word, args);
                }
                match word.to_lowercase().as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    _ => Ok(Expr::Column(word)),
                }
            }
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("意外的符号 {:?}", other)))
            }
            None => Err(self.error("表达式不完整")),
        }
    }

    fn parse_args(&mut self) -> QcResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(self.error("参数列表未闭合")),
            }
        }
    }
}

fn check_arity(func: &str, args: &[Expr], expected: usize) -> QcResult<()> {
    if args.len() != expected {
        return Err(QcError::Arity {
            func: func.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

/// 字符串常量参数（列名参数也接受裸标识符）
fn literal_arg(func: &str, args: &[Expr], index: usize, allow_ident: bool) -> QcResult<String> {
    match args.get(index) {
        Some(Expr::Literal(Value::Text(s))) => Ok(s.clone()),
        Some(Expr::Column(c)) if allow_ident => Ok(c.clone()),
        _ => Err(QcError::LiteralArgument {
            func: func.to_string(),
            index: index + 1,
        }),
    }
}

fn build_call(name: &str, mut args: Vec<Expr>) -> QcResult<Expr> {
    let func = name.to_lowercase();
    let scalar = match func.as_str() {
        "is_null" => Some(ScalarFn::IsNull),
        "is_blank" => Some(ScalarFn::IsBlank),
        "len" => Some(ScalarFn::Len),
        "num" => Some(ScalarFn::Num),
        "matches_date" => Some(ScalarFn::MatchesDate),
        _ => None,
    };
    if let Some(scalar) = scalar {
        check_arity(&func, &args, 1)?;
        let arg = args.remove(0);
        return Ok(Expr::Scalar(scalar, Box::new(arg)));
    }

    let aggregate = match func.as_str() {
        "null_rate" => Some(Aggregate::NullRate),
        "null_count" => Some(Aggregate::NullCount),
        "duplicate_count" => Some(Aggregate::DuplicateCount),
        _ => None,
    };
    if let Some(aggregate) = aggregate {
        check_arity(&func, &args, 1)?;
        let column = literal_arg(&func, &args, 0, true)?;
        return Ok(Expr::Aggregate(aggregate, Some(column)));
    }

    match func.as_str() {
        "row_count" => {
            check_arity(&func, &args, 0)?;
            Ok(Expr::Aggregate(Aggregate::RowCount, None))
        }
        "threshold" => {
            check_arity(&func, &args, 1)?;
            Ok(Expr::ThresholdKey(literal_arg(&func, &args, 0, false)?))
        }
        "exists_in" => {
            check_arity(&func, &args, 3)?;
            let table_code = literal_arg(&func, &args, 0, false)?;
            let column = literal_arg(&func, &args, 1, false)?;
            let table = TableType::from_code(&table_code)
                .ok_or_else(|| QcError::UnknownTable(table_code.clone()))?;
            if table.schema().column(&column).is_none() {
                return Err(QcError::UnknownColumn {
                    table: table.code().to_string(),
                    column,
                });
            }
            let value = args.remove(2);
            Ok(Expr::ExistsIn(table, column, Box::new(value)))
        }
        _ => Err(QcError::UnknownFunction(name.to_string())),
    }
}

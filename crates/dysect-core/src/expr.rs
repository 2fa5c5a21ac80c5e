//! Expression trees over target variables and constants.
//!
//! Grammar (C-like precedence, lowest first):
//!
//! ```text
//! expr     := or
//! or       := and ('||' and)*
//! and      := equality ('&&' equality)*
//! equality := relational (('==' | '!=') relational)*
//! relational := additive (('<' | '<=' | '>' | '>=') additive)*
//! additive := term (('+' | '-') term)*
//! term     := unary (('*' | '/') unary)*
//! unary    := ('!' | '-') unary | primary
//! primary  := IDENT | INT | '(' expr ')'
//! ```
//!
//! Evaluation at a stopped thread is tri-state: a leaf that fails to
//! resolve (optimized out, absent) poisons arithmetic and relational
//! operators with `Unresolved`, while boolean operators absorb it where
//! logic permits: `false && U = false`, `true || U = true`. `&&` with a
//! resolved-false left operand never evaluates the right operand.

use serde::{Deserialize, Serialize};

use crate::data_ref::{DataRef, ReadOutcome};
use crate::engine::{DebugEngine, ProcId, ThreadId};
use crate::error::{DysectError, Result};
use crate::value::Value;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    const fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
}

/// A node of the expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprNode {
    /// Integer or boolean literal.
    Const(Value),
    /// Target variable leaf.
    Var(DataRef),
    Unary {
        op: UnOp,
        child: Box<ExprNode>,
    },
    Binary {
        op: BinOp,
        lhs: Box<ExprNode>,
        rhs: Box<ExprNode>,
    },
}

/// Classification of an expression by its leaves, cached at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Only literals; evaluates without a target.
    Constant,
    /// References target variables.
    Target,
    /// References front-end global state (future hook, not parsed today).
    Global,
    /// Mixes target and global references.
    Mixed,
}

/// Tri-state evaluation outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Val(Value),
    Unresolved,
}

impl EvalOutcome {
    fn truthy(&self) -> Option<bool> {
        match self {
            Self::Unresolved => None,
            Self::Val(v) => match v.as_long() {
                Some(l) => Some(l != 0),
                None => v.as_double().map(|d| d != 0.0),
            },
        }
    }
}

/// A parsed expression plus its cached classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprTree {
    root: ExprNode,
    node_type: NodeType,
    source: String,
}

impl ExprTree {
    /// Parse an infix expression.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(DysectError::ResolutionFailure(format!(
                "trailing input in expression '{input}'"
            )));
        }
        let node_type = classify(&root);
        Ok(Self {
            root,
            node_type,
            source: input.to_string(),
        })
    }

    /// Cached leaf classification.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a stopped thread.
    pub fn evaluate(
        &self,
        engine: &dyn DebugEngine,
        proc: ProcId,
        thread: ThreadId,
    ) -> Result<EvalOutcome> {
        eval(&self.root, engine, proc, thread)
    }
}

fn classify(node: &ExprNode) -> NodeType {
    fn walk(node: &ExprNode, has_target: &mut bool) {
        match node {
            ExprNode::Const(_) => {}
            ExprNode::Var(_) => *has_target = true,
            ExprNode::Unary { child, .. } => walk(child, has_target),
            ExprNode::Binary { lhs, rhs, .. } => {
                walk(lhs, has_target);
                walk(rhs, has_target);
            }
        }
    }
    let mut has_target = false;
    walk(node, &mut has_target);
    if has_target {
        NodeType::Target
    } else {
        NodeType::Constant
    }
}

fn eval(
    node: &ExprNode,
    engine: &dyn DebugEngine,
    proc: ProcId,
    thread: ThreadId,
) -> Result<EvalOutcome> {
    match node {
        ExprNode::Const(v) => Ok(EvalOutcome::Val(*v)),
        ExprNode::Var(data_ref) => Ok(match data_ref.read(engine, proc, thread)? {
            ReadOutcome::Resolved(v) => EvalOutcome::Val(v),
            ReadOutcome::Unresolved => EvalOutcome::Unresolved,
        }),
        ExprNode::Unary { op, child } => {
            let inner = eval(child, engine, proc, thread)?;
            Ok(match op {
                UnOp::Not => match inner.truthy() {
                    Some(b) => EvalOutcome::Val(Value::Bool(!b)),
                    None => EvalOutcome::Unresolved,
                },
                UnOp::Neg => match inner {
                    EvalOutcome::Val(v) => match v.as_long() {
                        Some(l) => EvalOutcome::Val(Value::Long(-l)),
                        None => match v.as_double() {
                            Some(d) => EvalOutcome::Val(Value::Double(-d)),
                            None => EvalOutcome::Unresolved,
                        },
                    },
                    EvalOutcome::Unresolved => EvalOutcome::Unresolved,
                },
            })
        }
        ExprNode::Binary { op, lhs, rhs } if op.is_logical() => {
            eval_logical(*op, lhs, rhs, engine, proc, thread)
        }
        ExprNode::Binary { op, lhs, rhs } => {
            let left = eval(lhs, engine, proc, thread)?;
            let right = eval(rhs, engine, proc, thread)?;
            let (EvalOutcome::Val(a), EvalOutcome::Val(b)) = (&left, &right) else {
                return Ok(EvalOutcome::Unresolved);
            };
            Ok(apply_binary(*op, a, b))
        }
    }
}

fn eval_logical(
    op: BinOp,
    lhs: &ExprNode,
    rhs: &ExprNode,
    engine: &dyn DebugEngine,
    proc: ProcId,
    thread: ThreadId,
) -> Result<EvalOutcome> {
    let left = eval(lhs, engine, proc, thread)?.truthy();

    // Short circuit before touching the right operand.
    match (op, left) {
        (BinOp::And, Some(false)) => return Ok(EvalOutcome::Val(Value::Bool(false))),
        (BinOp::Or, Some(true)) => return Ok(EvalOutcome::Val(Value::Bool(true))),
        _ => {}
    }

    let right = eval(rhs, engine, proc, thread)?.truthy();

    let combined = match (op, left, right) {
        (BinOp::And, Some(true), Some(b)) => Some(b),
        (BinOp::And, None, Some(false)) | (BinOp::And, Some(false), _) => Some(false),
        (BinOp::Or, Some(false), Some(b)) => Some(b),
        (BinOp::Or, None, Some(true)) | (BinOp::Or, Some(true), _) => Some(true),
        _ => None,
    };

    Ok(match combined {
        Some(b) => EvalOutcome::Val(Value::Bool(b)),
        None => EvalOutcome::Unresolved,
    })
}

fn apply_binary(op: BinOp, a: &Value, b: &Value) -> EvalOutcome {
    match op {
        BinOp::Add => match a.try_add(b) {
            Some(v) => EvalOutcome::Val(v),
            None => EvalOutcome::Unresolved,
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div => arith(op, a, b),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
            match a.compare(b) {
                Some(ordering) => {
                    let result = match op {
                        BinOp::Lt => ordering.is_lt(),
                        BinOp::Le => ordering.is_le(),
                        BinOp::Gt => ordering.is_gt(),
                        BinOp::Ge => ordering.is_ge(),
                        BinOp::Eq => ordering.is_eq(),
                        BinOp::Ne => ordering.is_ne(),
                        _ => unreachable!("relational op"),
                    };
                    EvalOutcome::Val(Value::Bool(result))
                }
                None => EvalOutcome::Unresolved,
            }
        }
        BinOp::And | BinOp::Or => unreachable!("logical ops handled by eval_logical"),
    }
}

fn arith(op: BinOp, a: &Value, b: &Value) -> EvalOutcome {
    if a.is_long_like() && b.is_long_like() {
        let (Some(x), Some(y)) = (a.as_long(), b.as_long()) else {
            return EvalOutcome::Unresolved;
        };
        let out = match op {
            BinOp::Sub => Some(x.wrapping_sub(y)),
            BinOp::Mul => Some(x.wrapping_mul(y)),
            BinOp::Div => x.checked_div(y),
            _ => unreachable!("arith op"),
        };
        return match out {
            Some(v) => EvalOutcome::Val(Value::Long(v)),
            // Division by zero is unresolved, not fatal.
            None => EvalOutcome::Unresolved,
        };
    }
    let (Some(x), Some(y)) = (a.as_double(), b.as_double()) else {
        return EvalOutcome::Unresolved;
    };
    let out = match op {
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return EvalOutcome::Unresolved;
            }
            x / y
        }
        _ => unreachable!("arith op"),
    };
    EvalOutcome::Val(Value::Double(out))
}

// ---------------------------------------------------------------------------
// Tokenizer and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Op(BinOp),
    Not,
    Minus,
    Plus,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '&' | '|' => {
                if i + 1 < bytes.len() && bytes[i + 1] as char == c {
                    tokens.push(Token::Op(if c == '&' { BinOp::And } else { BinOp::Or }));
                    i += 2;
                } else {
                    return Err(parse_err(input, i, "expected '&&' or '||'"));
                }
            }
            '!' | '<' | '>' | '=' => {
                let eq_follows = i + 1 < bytes.len() && bytes[i + 1] == b'=';
                let token = match (c, eq_follows) {
                    ('!', true) => Token::Op(BinOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Op(BinOp::Le),
                    ('<', false) => Token::Op(BinOp::Lt),
                    ('>', true) => Token::Op(BinOp::Ge),
                    ('>', false) => Token::Op(BinOp::Gt),
                    ('=', true) => Token::Op(BinOp::Eq),
                    ('=', false) => return Err(parse_err(input, i, "expected '=='")),
                    _ => unreachable!(),
                };
                i += if eq_follows { 2 } else { 1 };
                tokens.push(token);
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let literal = &input[start..i];
                let value: i64 = literal.parse().map_err(|_| {
                    parse_err(input, start, "integer literal out of range")
                })?;
                tokens.push(Token::Int(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i] as char;
                    if b.is_ascii_alphanumeric() || b == '_' || b == '.' || b == ':' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            other => return Err(parse_err(input, i, &format!("unexpected '{other}'"))),
        }
    }

    Ok(tokens)
}

fn parse_err(input: &str, at: usize, what: &str) -> DysectError {
    DysectError::ResolutionFailure(format!("expression '{input}' at byte {at}: {what}"))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[BinOp]) -> Option<BinOp> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn parse_or(&mut self) -> Result<ExprNode> {
        let mut node = self.parse_and()?;
        while self.eat_op(&[BinOp::Or]).is_some() {
            let rhs = self.parse_and()?;
            node = binary(BinOp::Or, node, rhs);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<ExprNode> {
        let mut node = self.parse_equality()?;
        while self.eat_op(&[BinOp::And]).is_some() {
            let rhs = self.parse_equality()?;
            node = binary(BinOp::And, node, rhs);
        }
        Ok(node)
    }

    fn parse_equality(&mut self) -> Result<ExprNode> {
        let mut node = self.parse_relational()?;
        while let Some(op) = self.eat_op(&[BinOp::Eq, BinOp::Ne]) {
            let rhs = self.parse_relational()?;
            node = binary(op, node, rhs);
        }
        Ok(node)
    }

    fn parse_relational(&mut self) -> Result<ExprNode> {
        let mut node = self.parse_additive()?;
        while let Some(op) = self.eat_op(&[BinOp::Lt, BinOp::Le, BinOp::Gt, BinOp::Ge]) {
            let rhs = self.parse_additive()?;
            node = binary(op, node, rhs);
        }
        Ok(node)
    }

    fn parse_additive(&mut self) -> Result<ExprNode> {
        let mut node = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let rhs = self.parse_term()?;
                    node = binary(BinOp::Add, node, rhs);
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let rhs = self.parse_term()?;
                    node = binary(BinOp::Sub, node, rhs);
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_term(&mut self) -> Result<ExprNode> {
        let mut node = self.parse_unary()?;
        while let Some(op) = self.eat_op(&[BinOp::Mul, BinOp::Div]) {
            let rhs = self.parse_unary()?;
            node = binary(op, node, rhs);
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<ExprNode> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                let child = self.parse_unary()?;
                Ok(ExprNode::Unary {
                    op: UnOp::Not,
                    child: Box::new(child),
                })
            }
            Some(Token::Minus) => {
                self.pos += 1;
                let child = self.parse_unary()?;
                Ok(ExprNode::Unary {
                    op: UnOp::Neg,
                    child: Box::new(child),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<ExprNode> {
        match self.bump() {
            Some(Token::Int(value)) => Ok(ExprNode::Const(Value::Long(value))),
            Some(Token::Ident(name)) => Ok(ExprNode::Var(DataRef::parse(&name))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(DysectError::ResolutionFailure(
                        "unbalanced parenthesis in expression".into(),
                    )),
                }
            }
            other => Err(DysectError::ResolutionFailure(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}

fn binary(op: BinOp, lhs: ExprNode, rhs: ExprNode) -> ExprNode {
    ExprNode::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

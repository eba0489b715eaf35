//! Expression AST.

use serde_json::Value;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value (number, string, bool, null).
    Literal(Value),
    /// A root identifier resolved against the variable scope.
    Ident(String),
    /// Property access `base.name`.
    Member { base: Box<Expr>, name: String },
    /// Index access `base[expr]`.
    Index { base: Box<Expr>, index: Box<Expr> },
    /// Array literal `[a, b, c]`.
    Array(Vec<Expr>),
    /// Object literal `{k: v}`.
    Object(Vec<(String, Expr)>),
    /// Unary operator application.
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// Binary operator application.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Regex match `expr =~ /pattern/flags`.
    Match {
        expr: Box<Expr>,
        pattern: String,
        flags: String,
    },
    /// Ternary `cond ? then : otherwise`.
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Built-in function call `name(args…)`.  Pipes desugar to this.
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    /// Whether this expression is a pure path (identifier plus member/index
    /// accesses).  `isset` only accepts paths.
    pub fn is_path(&self) -> bool {
        match self {
            Self::Ident(_) => true,
            Self::Member { base, .. } => base.is_path(),
            Self::Index { base, index } => base.is_path() && matches!(**index, Self::Literal(_)),
            _ => false,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation `!`.
    Not,
    /// Arithmetic negation `-`.
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

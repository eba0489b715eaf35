//! Expression and template resolver for Flowdeck workflows.
//!
//! Given a [`flowdeck_core::VariableScope`] and a value of any shape, this
//! crate produces the resolved value: strings containing `{{ … }}` are
//! interpolated, and arrays/maps are walked structurally so every leaf
//! string is resolved.
//!
//! The expression language covers literals, dot-and-bracket paths, unary
//! and binary operators with standard precedence, a regex-match operator
//! (`=~ /…/flags`), ternaries, built-in function calls, and pipes
//! (`expr | filter: args`).  Evaluation is strict left-to-right with
//! short-circuit `&&`/`||`.
//!
//! A template consisting of exactly one `{{ expr }}` preserves the
//! evaluated value's type; anything else stringifies each part.  Missing
//! paths evaluate to null and stringify to the empty string.

mod ast;
mod eval;
mod functions;
mod parser;
mod template;
mod token;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use eval::{evaluate_expr, is_truthy, stringify};
pub use parser::parse_expression;
pub use template::{evaluate, evaluate_predicate, resolve, resolve_template};

//! Recursive-descent expression parser.
//!
//! Precedence, loosest first: pipe, ternary, `||`, `&&`, equality,
//! comparison / `=~`, additive, multiplicative, unary, postfix
//! (call / member / index), primary.

use flowdeck_core::{EngineError, Result};
use serde_json::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::token::{Token, tokenize};

/// Parse an expression source string into an AST.
pub fn parse_expression(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_pipe()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::expression(format!(
            "unexpected trailing input in expression `{src}`"
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(EngineError::expression(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    // -- Precedence levels ---------------------------------------------------

    /// `expr | filter[: args…]` desugars to `filter(expr, args…)`.
    fn parse_pipe(&mut self) -> Result<Expr> {
        let mut expr = self.parse_ternary()?;

        while self.eat(&Token::Pipe) {
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => {
                    return Err(EngineError::expression(format!(
                        "expected filter name after `|`, found {other:?}"
                    )));
                }
            };

            let mut args = vec![expr];
            if self.eat(&Token::Colon) {
                loop {
                    args.push(self.parse_ternary()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
            }
            expr = Expr::Call { name, args };
        }

        Ok(expr)
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        let cond = self.parse_or()?;

        if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            self.expect(&Token::Colon)?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }

        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            match self.peek() {
                Some(Token::Lt) | Some(Token::Le) | Some(Token::Gt) | Some(Token::Ge) => {
                    let op = match self.advance() {
                        Some(Token::Lt) => BinaryOp::Lt,
                        Some(Token::Le) => BinaryOp::Le,
                        Some(Token::Gt) => BinaryOp::Gt,
                        _ => BinaryOp::Ge,
                    };
                    let right = self.parse_additive()?;
                    left = binary(op, left, right);
                }
                Some(Token::Match) => {
                    self.pos += 1;
                    let (pattern, flags) = match self.advance() {
                        Some(Token::Regex { pattern, flags }) => (pattern, flags),
                        other => {
                            return Err(EngineError::expression(format!(
                                "expected regex literal after `=~`, found {other:?}"
                            )));
                        }
                    };
                    left = Expr::Match {
                        expr: Box::new(left),
                        pattern,
                        flags,
                    };
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Token::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    /// Member access, index access, and function calls bind tightest.
    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(EngineError::expression(format!(
                            "expected property name after `.`, found {other:?}"
                        )));
                    }
                };
                expr = Expr::Member {
                    base: Box::new(expr),
                    name,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_pipe()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek() == Some(&Token::LParen) {
                // Only bare identifiers are callable (built-in functions).
                let Expr::Ident(name) = expr else {
                    return Err(EngineError::expression(
                        "only built-in function names can be called",
                    ));
                };
                self.pos += 1;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_pipe()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                }
                expr = Expr::Call { name, args };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(raw)) => {
                let value = if raw.contains('.') {
                    raw.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                } else {
                    raw.parse::<i64>().ok().map(|n| Value::Number(n.into()))
                };
                value.map(Expr::Literal).ok_or_else(|| {
                    EngineError::expression(format!("invalid number literal `{raw}`"))
                })
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::LParen) => {
                let expr = self.parse_pipe()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_pipe()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RBracket)?;
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Ident(k)) | Some(Token::Str(k)) => k,
                            other => {
                                return Err(EngineError::expression(format!(
                                    "expected object key, found {other:?}"
                                )));
                            }
                        };
                        self.expect(&Token::Colon)?;
                        let value = self.parse_pipe()?;
                        entries.push((key, value));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RBrace)?;
                }
                Ok(Expr::Object(entries))
            }
            other => Err(EngineError::expression(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn precedence_mul_over_add() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(
                *right,
                Expr::Binary {
                    op: BinaryOp::Mul,
                    ..
                }
            )),
            other => panic!("expected addition at the root, got {other:?}"),
        }
    }

    #[test]
    fn path_with_brackets() {
        let expr = parse_expression("a.b[0].c").unwrap();
        assert!(expr.is_path());
    }

    #[test]
    fn call_with_args() {
        let expr = parse_expression("min(1, 2, x)").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "min");
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn pipe_desugars_to_call() {
        let expr = parse_expression("name | upper").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "upper");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected call, got {other:?}"),
        }

        let expr = parse_expression("items | join: \", \"").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "join");
                assert_eq!(args.len(), 2);
                assert_eq!(args[1], Expr::Literal(json!(", ")));
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn chained_pipes() {
        let expr = parse_expression("s | trim | upper").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "upper");
                assert!(matches!(&args[0], Expr::Call { name, .. } if name == "trim"));
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn ternary_right_associative() {
        let expr = parse_expression("a ? 1 : b ? 2 : 3").unwrap();
        match expr {
            Expr::Ternary { otherwise, .. } => {
                assert!(matches!(*otherwise, Expr::Ternary { .. }));
            }
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn regex_match_expression() {
        let expr = parse_expression(r"email =~ /@(.+)$/").unwrap();
        match expr {
            Expr::Match { pattern, flags, .. } => {
                assert_eq!(pattern, "@(.+)$");
                assert!(flags.is_empty());
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn literals() {
        assert_eq!(
            parse_expression("true").unwrap(),
            Expr::Literal(json!(true))
        );
        assert_eq!(parse_expression("null").unwrap(), Expr::Literal(json!(null)));
        assert_eq!(
            parse_expression("undefined").unwrap(),
            Expr::Literal(json!(null))
        );
        assert_eq!(parse_expression("1.5").unwrap(), Expr::Literal(json!(1.5)));
    }

    #[test]
    fn array_and_object_literals() {
        let expr = parse_expression("[1, 'two', {k: 3}]").unwrap();
        match expr {
            Expr::Array(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(&items[2], Expr::Object(entries) if entries.len() == 1));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse_expression("1 + 2 )").is_err());
    }

    #[test]
    fn short_circuit_shape() {
        let expr = parse_expression("a || b && c").unwrap();
        // `&&` binds tighter than `||`.
        match expr {
            Expr::Binary {
                op: BinaryOp::Or,
                right,
                ..
            } => assert!(matches!(
                *right,
                Expr::Binary {
                    op: BinaryOp::And,
                    ..
                }
            )),
            other => panic!("expected or at the root, got {other:?}"),
        }
    }
}

//! Expression tokenizer.
//!
//! Hand-written single-pass lexer.  The only stateful wrinkle is the regex
//! literal: a `/` immediately following the `=~` operator starts a
//! `/pattern/flags` literal rather than a division operator.

use flowdeck_core::{EngineError, Result};

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Numeric literal, preserved as raw text until parse.
    Number(String),
    /// Quoted string literal (quotes stripped, escapes applied).
    Str(String),
    /// Identifier or keyword.
    Ident(String),
    /// Regex literal following `=~`.
    Regex { pattern: String, flags: String },

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Question,

    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Pipe,
    Match,
}

/// Tokenize an expression source string.
pub fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    // Set after `=~` so the next `/` starts a regex literal.
    let mut expect_regex = false;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if expect_regex && c == '/' {
            let (token, next) = lex_regex(&chars, i)?;
            tokens.push(token);
            i = next;
            expect_regex = false;
            continue;
        }
        expect_regex = false;

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                // A dot not followed by a digit is a path separator, not a
                // decimal point (`a.1.b` never appears; `[0].c` does).
                if chars[i] == '.' && !chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                    break;
                }
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }

        if c == '"' || c == '\'' {
            let (s, next) = lex_string(&chars, i, c)?;
            tokens.push(Token::Str(s));
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match two.as_str() {
            "==" => {
                tokens.push(Token::EqEq);
                i += 2;
                continue;
            }
            "!=" => {
                tokens.push(Token::NotEq);
                i += 2;
                continue;
            }
            "<=" => {
                tokens.push(Token::Le);
                i += 2;
                continue;
            }
            ">=" => {
                tokens.push(Token::Ge);
                i += 2;
                continue;
            }
            "&&" => {
                tokens.push(Token::AndAnd);
                i += 2;
                continue;
            }
            "||" => {
                tokens.push(Token::OrOr);
                i += 2;
                continue;
            }
            "=~" => {
                tokens.push(Token::Match);
                expect_regex = true;
                i += 2;
                continue;
            }
            _ => {}
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '.' => Token::Dot,
            '?' => Token::Question,
            '!' => Token::Bang,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '<' => Token::Lt,
            '>' => Token::Gt,
            '|' => Token::Pipe,
            other => {
                return Err(EngineError::expression(format!(
                    "unexpected character `{other}` in expression"
                )));
            }
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize, quote: char) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                let escaped = chars[i + 1];
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Err(EngineError::expression("unterminated string literal"))
}

fn lex_regex(chars: &[char], start: usize) -> Result<(Token, usize)> {
    let mut pattern = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                pattern.push('\\');
                pattern.push(chars[i + 1]);
                i += 2;
            }
            '/' => {
                i += 1;
                let mut flags = String::new();
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    flags.push(chars[i]);
                    i += 1;
                }
                return Ok((Token::Regex { pattern, flags }, i));
            }
            c => {
                pattern.push(c);
                i += 1;
            }
        }
    }

    Err(EngineError::expression("unterminated regex literal"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

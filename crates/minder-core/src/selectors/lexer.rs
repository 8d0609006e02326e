//! Tokenizer for profile selector expressions.
//!
//! Tokens carry 1-based line/column spans so compile failures can point at
//! the offending position in the source.

use super::Diagnostic;

/// A source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Line number.
    pub line: u32,
    /// Column number.
    pub col: u32,
}

impl Span {
    pub(crate) const START: Self = Self { line: 1, col: 1 };
}

/// The token kinds of the selector language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// An identifier (variable or member name).
    Ident(String),
    /// A quoted string literal.
    Str(String),
    /// A signed 64-bit integer literal.
    Int(i64),
    /// `true`
    True,
    /// `false`
    False,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `&&`
    AndAnd,
    /// `||`
    OrOr,
    /// `!`
    Bang,
    /// `in`
    In,
    /// `.`
    Dot,
    /// `,`
    Comma,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
}

/// A token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// What was lexed.
    pub kind: TokenKind,
    /// Where it starts.
    pub span: Span,
}

/// Tokenizes a selector expression.
///
/// # Errors
///
/// Returns one diagnostic per unlexable construct; tokens up to the first
/// failure are discarded.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Vec<Diagnostic>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut span = Span::START;

    while let Some(&c) = chars.peek() {
        let start = span;
        match c {
            '\n' => {
                chars.next();
                span.line += 1;
                span.col = 1;
            }
            c if c.is_whitespace() => {
                chars.next();
                span.col += 1;
            }
            '(' | ')' | '[' | ']' | '.' | ',' => {
                chars.next();
                span.col += 1;
                let kind = match c {
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '.' => TokenKind::Dot,
                    _ => TokenKind::Comma,
                };
                tokens.push(Token { kind, span: start });
            }
            '=' => {
                chars.next();
                span.col += 1;
                if chars.peek() == Some(&'=') {
                    chars.next();
                    span.col += 1;
                    tokens.push(Token {
                        kind: TokenKind::EqEq,
                        span: start,
                    });
                } else {
                    return Err(vec![Diagnostic::new(
                        start,
                        "expected '==', found bare '='",
                    )]);
                }
            }
            '!' => {
                chars.next();
                span.col += 1;
                if chars.peek() == Some(&'=') {
                    chars.next();
                    span.col += 1;
                    tokens.push(Token {
                        kind: TokenKind::NotEq,
                        span: start,
                    });
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Bang,
                        span: start,
                    });
                }
            }
            '&' => {
                chars.next();
                span.col += 1;
                if chars.peek() == Some(&'&') {
                    chars.next();
                    span.col += 1;
                    tokens.push(Token {
                        kind: TokenKind::AndAnd,
                        span: start,
                    });
                } else {
                    return Err(vec![Diagnostic::new(start, "expected '&&'")]);
                }
            }
            '|' => {
                chars.next();
                span.col += 1;
                if chars.peek() == Some(&'|') {
                    chars.next();
                    span.col += 1;
                    tokens.push(Token {
                        kind: TokenKind::OrOr,
                        span: start,
                    });
                } else {
                    return Err(vec![Diagnostic::new(start, "expected '||'")]);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                span.col += 1;
                let mut value = String::new();
                let mut terminated = false;
                while let Some(&next) = chars.peek() {
                    chars.next();
                    span.col += 1;
                    if next == quote {
                        terminated = true;
                        break;
                    }
                    if next == '\n' {
                        break;
                    }
                    value.push(next);
                }
                if !terminated {
                    return Err(vec![Diagnostic::new(start, "unterminated string literal")]);
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    span: start,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                span.col += 1;
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_digit() {
                        literal.push(next);
                        chars.next();
                        span.col += 1;
                    } else {
                        break;
                    }
                }
                match literal.parse::<i64>() {
                    Ok(value) => tokens.push(Token {
                        kind: TokenKind::Int(value),
                        span: start,
                    }),
                    Err(_) => {
                        return Err(vec![Diagnostic::new(
                            start,
                            format!("invalid integer literal {literal:?}"),
                        )]);
                    }
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        ident.push(next);
                        chars.next();
                        span.col += 1;
                    } else {
                        break;
                    }
                }
                let kind = match ident.as_str() {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "in" => TokenKind::In,
                    _ => TokenKind::Ident(ident),
                };
                tokens.push(Token { kind, span: start });
            }
            other => {
                return Err(vec![Diagnostic::new(
                    start,
                    format!("unexpected character {other:?}"),
                )]);
            }
        }
    }

    Ok(tokens)
}

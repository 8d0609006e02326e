//! Recursive-descent parser for selector expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr     := and ( "||" and )*
//! and      := cmp ( "&&" cmp )*
//! cmp      := unary ( ( "==" | "!=" | "in" ) unary )?
//! unary    := "!" unary | postfix
//! postfix  := primary ( "." ident | "[" string "]" )*
//! primary  := literal | ident | list | "(" expr ")"
//! list     := "[" ( unary ( "," unary )* )? "]"
//! ```

use super::lexer::{Span, Token, TokenKind, tokenize};
use super::Diagnostic;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `in`
    In,
    /// `&&`
    And,
    /// `||`
    Or,
}

/// A member-access path rooted at a variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// Root variable followed by member names.
    pub segments: Vec<String>,
    /// Position of the root.
    pub span: Span,
}

impl Path {
    /// Dotted rendering, used for unknown-path matching.
    #[must_use]
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

/// A parsed selector expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Boolean literal.
    Bool(bool, Span),
    /// Integer literal.
    Int(i64, Span),
    /// String literal.
    Str(String, Span),
    /// List literal, only valid as an `in` right-hand side.
    List(Vec<Expr>, Span),
    /// Variable or member access.
    Path(Path),
    /// Logical negation.
    Not(Box<Expr>, Span),
    /// Binary operation.
    Binary {
        /// The operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
        /// Operator position.
        span: Span,
    },
}

impl Expr {
    /// The position of this expression.
    #[must_use]
    pub fn span(&self) -> Span {
        match self {
            Self::Bool(_, span)
            | Self::Int(_, span)
            | Self::Str(_, span)
            | Self::List(_, span)
            | Self::Not(_, span)
            | Self::Binary { span, .. } => *span,
            Self::Path(path) => path.span,
        }
    }
}

/// Parses a selector expression into its AST.
///
/// # Errors
///
/// Returns positioned diagnostics for lexical and syntactic failures.
pub fn parse(source: &str) -> Result<Expr, Vec<Diagnostic>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(vec![Diagnostic::new(
            extra.span,
            "unexpected trailing input",
        )]);
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

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn end_span(&self) -> Span {
        self.tokens
            .last()
            .map_or(Span::START, |t| t.span)
    }

    fn expr(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        let mut lhs = self.and()?;
        while let Some(token) = self.peek() {
            if token.kind != TokenKind::OrOr {
                break;
            }
            let span = token.span;
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        let mut lhs = self.cmp()?;
        while let Some(token) = self.peek() {
            if token.kind != TokenKind::AndAnd {
                break;
            }
            let span = token.span;
            self.pos += 1;
            let rhs = self.cmp()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn cmp(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        let lhs = self.unary()?;
        let op = match self.peek().map(|t| (&t.kind, t.span)) {
            Some((TokenKind::EqEq, span)) => (BinOp::Eq, span),
            Some((TokenKind::NotEq, span)) => (BinOp::Ne, span),
            Some((TokenKind::In, span)) => (BinOp::In, span),
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.unary()?;
        Ok(Expr::Binary {
            op: op.0,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            span: op.1,
        })
    }

    fn unary(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        if let Some(token) = self.peek() {
            if token.kind == TokenKind::Bang {
                let span = token.span;
                self.pos += 1;
                let inner = self.unary()?;
                return Ok(Expr::Not(Box::new(inner), span));
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        let primary = self.primary()?;
        let Expr::Path(mut path) = primary else {
            return Ok(primary);
        };
        loop {
            if self.eat(&TokenKind::Dot) {
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::Ident(name),
                        ..
                    }) => path.segments.push(name),
                    Some(token) => {
                        return Err(vec![Diagnostic::new(
                            token.span,
                            "expected member name after '.'",
                        )]);
                    }
                    None => {
                        return Err(vec![Diagnostic::new(
                            self.end_span(),
                            "expected member name after '.'",
                        )]);
                    }
                }
            } else if self.peek().is_some_and(|t| t.kind == TokenKind::LBracket) {
                let bracket_span = self.peek().map_or(Span::START, |t| t.span);
                self.pos += 1;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::Str(key),
                        ..
                    }) => {
                        if !self.eat(&TokenKind::RBracket) {
                            return Err(vec![Diagnostic::new(
                                bracket_span,
                                "expected ']' after index",
                            )]);
                        }
                        path.segments.push(key);
                    }
                    other => {
                        let span = other.map_or(self.end_span(), |t| t.span);
                        return Err(vec![Diagnostic::new(
                            span,
                            "index must be a string literal",
                        )]);
                    }
                }
            } else {
                break;
            }
        }
        Ok(Expr::Path(path))
    }

    fn primary(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        let Some(token) = self.advance() else {
            return Err(vec![Diagnostic::new(
                self.end_span(),
                "unexpected end of expression",
            )]);
        };
        match token.kind {
            TokenKind::True => Ok(Expr::Bool(true, token.span)),
            TokenKind::False => Ok(Expr::Bool(false, token.span)),
            TokenKind::Int(value) => Ok(Expr::Int(value, token.span)),
            TokenKind::Str(value) => Ok(Expr::Str(value, token.span)),
            TokenKind::Ident(name) => Ok(Expr::Path(Path {
                segments: vec![name],
                span: token.span,
            })),
            TokenKind::LParen => {
                let inner = self.expr()?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(vec![Diagnostic::new(token.span, "unclosed '('")]);
                }
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        items.push(self.unary()?);
                        if self.eat(&TokenKind::Comma) {
                            continue;
                        }
                        if self.eat(&TokenKind::RBracket) {
                            break;
                        }
                        return Err(vec![Diagnostic::new(
                            token.span,
                            "expected ',' or ']' in list literal",
                        )]);
                    }
                }
                Ok(Expr::List(items, token.span))
            }
            other => Err(vec![Diagnostic::new(
                token.span,
                format!("unexpected token {other:?}"),
            )]),
        }
    }
}

//! Profile selector compilation and evaluation.
//!
//! A selector is a restricted boolean expression deciding whether a profile
//! applies to an entity. Expressions are compiled against per-entity-type
//! environments (built at-most-once process-wide) and evaluated with
//! partial-evaluation support: reads of attributes declared unknown, or
//! simply absent, surface [`Selection::Unknown`] so the caller can fetch
//! more properties and retry instead of concluding `false`.

mod check;
mod eval;
mod lexer;
mod parser;

use serde::Serialize;
use thiserror::Error;

use crate::entities::EntityType;

pub use check::environment;
pub use eval::{EvalError, EvalOptions, SelectorEntity, Tri};
pub use lexer::Span;
pub use parser::Expr;

/// A single compile failure with its source position.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
    /// Failure description.
    pub msg: String,
}

impl Diagnostic {
    pub(crate) fn new(span: Span, msg: impl Into<String>) -> Self {
        Self {
            line: span.line,
            col: span.col,
            msg: msg.into(),
        }
    }
}

/// The diagnostics attached to a failed compilation.
#[derive(Debug, Clone, Serialize)]
pub struct CompileDiagnostics {
    /// The expression source that failed.
    pub source: String,
    /// One entry per failure.
    pub errors: Vec<Diagnostic>,
}

impl std::fmt::Display for CompileDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}:{} {}", err.line, err.col, err.msg)?;
        }
        Ok(())
    }
}

/// Selector compilation and evaluation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SelectorError {
    /// The expression did not parse.
    #[error("selector parse failed: {0}")]
    Parse(CompileDiagnostics),

    /// The expression parsed but did not type-check.
    #[error("selector check failed: {0}")]
    Check(CompileDiagnostics),

    /// Evaluation hit a runtime type violation.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl SelectorError {
    /// The structured JSON form returned to profile-configuration callers.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Parse(details) => serde_json::json!({
                "err": "parse",
                "details": details,
            }),
            Self::Check(details) => serde_json::json!({
                "err": "check",
                "details": details,
            }),
            Self::Eval(err) => serde_json::json!({
                "err": "eval",
                "details": {"msg": err.to_string()},
            }),
        }
    }
}

/// An uncompiled profile selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    /// The entity type the selector applies to; unspecified means the
    /// expression is generic over `entity` and applies to every type.
    pub entity_type: EntityType,
    /// The expression source.
    pub expression: String,
}

/// A compiled selector: source retained for reporting, program for
/// evaluation.
#[derive(Debug, Clone)]
struct CompiledSelector {
    entity_type: EntityType,
    source: String,
    program: Expr,
}

/// The outcome of checking an entity against a selector set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every applicable selector evaluated true.
    Selected,
    /// An applicable selector evaluated false.
    NotSelected {
        /// The source of the selector that rejected the entity.
        source: String,
    },
    /// An applicable selector could not be resolved; fetch more properties
    /// and retry.
    Unknown,
}

/// Compiles profile selectors and evaluates entities against them.
///
/// The compiled programs are stateless and safe for concurrent use.
#[derive(Debug, Clone, Default)]
pub struct SelectionChecker {
    selectors: Vec<CompiledSelector>,
}

impl SelectionChecker {
    /// Compiles a selector set.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError::Parse`] or [`SelectorError::Check`] with
    /// positioned diagnostics for the first failing selector.
    pub fn compile(selectors: &[Selector]) -> Result<Self, SelectorError> {
        let mut compiled = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let program = parser::parse(&selector.expression).map_err(|errors| {
                SelectorError::Parse(CompileDiagnostics {
                    source: selector.expression.clone(),
                    errors,
                })
            })?;
            let env = check::environment(selector.entity_type);
            check::check(&program, env).map_err(|errors| {
                SelectorError::Check(CompileDiagnostics {
                    source: selector.expression.clone(),
                    errors,
                })
            })?;
            compiled.push(CompiledSelector {
                entity_type: selector.entity_type,
                source: selector.expression.clone(),
                program,
            });
        }
        Ok(Self {
            selectors: compiled,
        })
    }

    /// Number of compiled selectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    /// True when no selectors are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// Evaluates the subject against every applicable selector.
    ///
    /// Selectors whose entity type differs from the subject's are skipped.
    /// Returns on the first definitive `false` or the first unknown.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError::Eval`] for runtime type violations.
    pub fn select(
        &self,
        subject: &SelectorEntity,
        opts: &EvalOptions,
    ) -> Result<Selection, SelectorError> {
        for selector in &self.selectors {
            if !selector.entity_type.is_unspecified()
                && selector.entity_type != subject.entity_type()
            {
                continue;
            }
            match eval::eval(&selector.program, subject, opts)? {
                Tri::True => {}
                Tri::False => {
                    return Ok(Selection::NotSelected {
                        source: selector.source.clone(),
                    });
                }
                Tri::Unknown => return Ok(Selection::Unknown),
            }
        }
        Ok(Selection::Selected)
    }
}

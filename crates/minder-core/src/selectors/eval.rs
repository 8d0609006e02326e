//! Tri-state evaluation of compiled selector expressions.
//!
//! Evaluation is three-valued: a read of a declared-unknown attribute path,
//! or of an attribute that is simply absent, produces `Unknown` rather than
//! `false`, so callers can fetch more properties and retry.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::entities::{Entity, EntityType, Properties, PropertyValue};

use super::parser::{BinOp, Expr, Path};

/// Three-valued evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    /// Definitely true.
    True,
    /// Definitely false.
    False,
    /// Unresolved; more properties are needed.
    Unknown,
}

impl Tri {
    fn from_bool(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }

    fn negate(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Unknown => Self::Unknown,
        }
    }
}

/// Evaluation failures that are not mere unknowns.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvalError {
    /// A non-boolean value appeared where a boolean was required.
    #[error("expression at {line}:{col} did not evaluate to a boolean")]
    NotBoolean {
        /// Source line.
        line: u32,
        /// Source column.
        col: u32,
    },

    /// The right-hand side of `in` was not a list.
    #[error("'in' right-hand side at {line}:{col} is not a list")]
    NotAList {
        /// Source line.
        line: u32,
        /// Source column.
        col: u32,
    },
}

/// Per-call evaluation options.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Dotted attribute-path prefixes to treat as unknown, e.g.
    /// `repository.properties`.
    pub unknown_paths: Vec<String>,
}

/// The evaluation subject: root variables assembled from an entity.
///
/// The entity is exposed under its type key (`repository`, `artifact`, ...)
/// and simultaneously under the generic `entity` root.
#[derive(Debug, Clone)]
pub struct SelectorEntity {
    entity_type: EntityType,
    roots: BTreeMap<String, PropertyValue>,
}

impl SelectorEntity {
    /// Assembles the subject from an entity identity, without properties.
    #[must_use]
    pub fn new(entity: &Entity) -> Self {
        let generic = PropertyValue::Struct(BTreeMap::from([
            ("id".to_owned(), PropertyValue::String(entity.id.to_string())),
            (
                "name".to_owned(),
                PropertyValue::String(entity.name.clone()),
            ),
            (
                "type".to_owned(),
                PropertyValue::String(entity.entity_type.as_str().to_owned()),
            ),
            (
                "provider".to_owned(),
                PropertyValue::String(entity.provider_id.to_string()),
            ),
            (
                "project".to_owned(),
                PropertyValue::String(entity.project_id.to_string()),
            ),
        ]));
        let typed = PropertyValue::Struct(BTreeMap::from([
            (
                "name".to_owned(),
                PropertyValue::String(entity.name.clone()),
            ),
            (
                "provider".to_owned(),
                PropertyValue::String(entity.provider_id.to_string()),
            ),
        ]));
        Self {
            entity_type: entity.entity_type,
            roots: BTreeMap::from([
                ("entity".to_owned(), generic),
                (entity.entity_type.as_str().to_owned(), typed),
            ]),
        }
    }

    /// Attaches a property snapshot under the typed root's `properties`
    /// field. Property keys are nested on `/`, so `github/is_fork` becomes
    /// `properties.github.is_fork`.
    #[must_use]
    pub fn with_properties(mut self, properties: &Properties) -> Self {
        let nested = nest_properties(properties);
        if let Some(PropertyValue::Struct(typed)) =
            self.roots.get_mut(self.entity_type.as_str())
        {
            typed.insert("properties".to_owned(), nested);
        }
        self
    }

    /// The subject's entity type.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn resolve(&self, path: &Path, opts: &EvalOptions) -> Option<PropertyValue> {
        // A declared-unknown prefix shadows anything actually present.
        let mut dotted = String::new();
        for (i, segment) in path.segments.iter().enumerate() {
            if i > 0 {
                dotted.push('.');
            }
            dotted.push_str(segment);
            if opts.unknown_paths.iter().any(|p| p == &dotted) {
                return None;
            }
        }

        let mut current = self.roots.get(path.segments.first()?)?;
        for segment in &path.segments[1..] {
            match current {
                PropertyValue::Struct(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current.clone())
    }
}

fn nest_properties(properties: &Properties) -> PropertyValue {
    let mut root: BTreeMap<String, PropertyValue> = BTreeMap::new();
    for (key, prop) in properties.iter() {
        let mut parts = key.split('/').peekable();
        let mut cursor = &mut root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                cursor.insert(part.to_owned(), prop.value().clone());
            } else {
                let entry = cursor
                    .entry(part.to_owned())
                    .or_insert_with(|| PropertyValue::Struct(BTreeMap::new()));
                match entry {
                    PropertyValue::Struct(map) => cursor = map,
                    // A scalar already claimed this segment; later nested
                    // keys under it are dropped.
                    _ => break,
                }
            }
        }
    }
    PropertyValue::Struct(root)
}

/// Evaluates a compiled expression against a subject.
///
/// # Errors
///
/// Returns [`EvalError`] for runtime type violations the static checker
/// could not see through dynamic `properties` access.
pub fn eval(
    expr: &Expr,
    subject: &SelectorEntity,
    opts: &EvalOptions,
) -> Result<Tri, EvalError> {
    eval_bool(expr, subject, opts)
}

/// A resolved operand value; `None` means unknown.
type Resolved = Option<PropertyValue>;

fn eval_bool(
    expr: &Expr,
    subject: &SelectorEntity,
    opts: &EvalOptions,
) -> Result<Tri, EvalError> {
    match expr {
        Expr::Bool(b, _) => Ok(Tri::from_bool(*b)),
        Expr::Int(_, span) | Expr::Str(_, span) | Expr::List(_, span) => {
            Err(EvalError::NotBoolean {
                line: span.line,
                col: span.col,
            })
        }
        Expr::Path(path) => match subject.resolve(path, opts) {
            None => Ok(Tri::Unknown),
            Some(PropertyValue::Bool(b)) => Ok(Tri::from_bool(b)),
            Some(_) => Err(EvalError::NotBoolean {
                line: path.span.line,
                col: path.span.col,
            }),
        },
        Expr::Not(inner, _) => Ok(eval_bool(inner, subject, opts)?.negate()),
        Expr::Binary {
            op,
            lhs,
            rhs,
            span,
        } => match op {
            BinOp::And => {
                let l = eval_bool(lhs, subject, opts)?;
                let r = eval_bool(rhs, subject, opts)?;
                Ok(match (l, r) {
                    (Tri::False, _) | (_, Tri::False) => Tri::False,
                    (Tri::Unknown, _) | (_, Tri::Unknown) => Tri::Unknown,
                    _ => Tri::True,
                })
            }
            BinOp::Or => {
                let l = eval_bool(lhs, subject, opts)?;
                let r = eval_bool(rhs, subject, opts)?;
                Ok(match (l, r) {
                    (Tri::True, _) | (_, Tri::True) => Tri::True,
                    (Tri::Unknown, _) | (_, Tri::Unknown) => Tri::Unknown,
                    _ => Tri::False,
                })
            }
            BinOp::Eq | BinOp::Ne => {
                let l = eval_value(lhs, subject, opts)?;
                let r = eval_value(rhs, subject, opts)?;
                let (Some(l), Some(r)) = (l, r) else {
                    return Ok(Tri::Unknown);
                };
                let equal = values_equal(&l, &r);
                Ok(Tri::from_bool(if *op == BinOp::Eq { equal } else { !equal }))
            }
            BinOp::In => {
                let Some(needle) = eval_value(lhs, subject, opts)? else {
                    return Ok(Tri::Unknown);
                };
                let Some(haystack) = eval_value(rhs, subject, opts)? else {
                    return Ok(Tri::Unknown);
                };
                match haystack {
                    PropertyValue::List(items) => Ok(Tri::from_bool(
                        items.iter().any(|item| values_equal(&needle, item)),
                    )),
                    _ => Err(EvalError::NotAList {
                        line: span.line,
                        col: span.col,
                    }),
                }
            }
        },
    }
}

fn eval_value(
    expr: &Expr,
    subject: &SelectorEntity,
    opts: &EvalOptions,
) -> Result<Resolved, EvalError> {
    match expr {
        Expr::Bool(b, _) => Ok(Some(PropertyValue::Bool(*b))),
        Expr::Int(v, _) => Ok(Some(PropertyValue::Int64(*v))),
        Expr::Str(s, _) => Ok(Some(PropertyValue::String(s.clone()))),
        Expr::List(items, _) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match eval_value(item, subject, opts)? {
                    Some(value) => values.push(value),
                    None => return Ok(None),
                }
            }
            Ok(Some(PropertyValue::List(values)))
        }
        Expr::Path(path) => Ok(subject.resolve(path, opts)),
        Expr::Not(..) | Expr::Binary { .. } => Ok(match eval_bool(expr, subject, opts)? {
            Tri::True => Some(PropertyValue::Bool(true)),
            Tri::False => Some(PropertyValue::Bool(false)),
            Tri::Unknown => None,
        }),
    }
}

/// Value equality with numeric cross-kind comparison; other cross-kind
/// comparisons are plainly unequal.
fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    use PropertyValue as V;
    #[allow(clippy::cast_precision_loss)]
    match (a, b) {
        (V::Int64(x), V::Uint64(y)) | (V::Uint64(y), V::Int64(x)) => {
            u64::try_from(*x).is_ok_and(|x| x == *y)
        }
        (V::Int64(x), V::Double(y)) | (V::Double(y), V::Int64(x)) => (*x as f64) == *y,
        (V::Uint64(x), V::Double(y)) | (V::Double(y), V::Uint64(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

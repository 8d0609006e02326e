//! Static type checking of selector expressions against per-type schemas.
//!
//! Each entity type gets a compiled environment declaring the root variables
//! an expression may reference. The generic `entity` root is always
//! declared; the typed root (e.g. `repository`) only in its own
//! environment. Paths under a `properties` field are dynamic and escape
//! static checking.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::entities::EntityType;

use super::parser::{BinOp, Expr};
use super::Diagnostic;

/// The static kind of a checked expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Boolean.
    Bool,
    /// 64-bit integer.
    Int,
    /// String.
    String,
    /// List of dynamic values.
    List,
    /// Unknown until runtime; no static checking beyond this point.
    Dyn,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::String => "string",
            Self::List => "list",
            Self::Dyn => "dyn",
        }
    }

    fn compatible(self, other: Self) -> bool {
        self == Self::Dyn || other == Self::Dyn || self == other
    }
}

/// Schema node for a declared field.
#[derive(Debug, Clone)]
pub enum FieldSchema {
    /// A leaf of a concrete kind.
    Leaf(Kind),
    /// A sub-structure with declared fields.
    Struct(BTreeMap<&'static str, FieldSchema>),
}

/// A compiled per-type environment: the declared root variables.
#[derive(Debug, Clone)]
pub struct TypeEnv {
    roots: BTreeMap<&'static str, FieldSchema>,
}

impl TypeEnv {
    /// Resolves a path against the declared roots.
    fn kind_of_path(&self, segments: &[String]) -> Result<Kind, String> {
        let root = segments
            .first()
            .ok_or_else(|| "empty path".to_owned())?;
        let mut schema = self
            .roots
            .get(root.as_str())
            .ok_or_else(|| format!("undeclared variable {root:?}"))?;
        for segment in &segments[1..] {
            match schema {
                FieldSchema::Leaf(Kind::Dyn) => return Ok(Kind::Dyn),
                FieldSchema::Leaf(kind) => {
                    return Err(format!(
                        "cannot access member {segment:?} on {} value",
                        kind.name()
                    ));
                }
                FieldSchema::Struct(fields) => {
                    schema = fields.get(segment.as_str()).ok_or_else(|| {
                        format!("undefined field {segment:?}")
                    })?;
                }
            }
        }
        Ok(match schema {
            FieldSchema::Leaf(kind) => *kind,
            FieldSchema::Struct(_) => Kind::Dyn,
        })
    }
}

/// The process-wide environment cache, one entry per entity type plus the
/// generic environment. Built exactly once, read-only afterwards.
static ENVIRONMENTS: OnceLock<BTreeMap<EntityType, TypeEnv>> = OnceLock::new();

/// Returns the compiled environment for an entity type.
///
/// `EntityType::Unspecified` yields the generic environment declaring only
/// `entity`.
pub fn environment(entity_type: EntityType) -> &'static TypeEnv {
    let envs = ENVIRONMENTS.get_or_init(build_environments);
    envs.get(&entity_type)
        .unwrap_or_else(|| &envs[&EntityType::Unspecified])
}

fn build_environments() -> BTreeMap<EntityType, TypeEnv> {
    let mut envs = BTreeMap::new();
    envs.insert(
        EntityType::Unspecified,
        TypeEnv {
            roots: BTreeMap::from([("entity", entity_schema())]),
        },
    );
    for entity_type in EntityType::ALL {
        envs.insert(
            entity_type,
            TypeEnv {
                roots: BTreeMap::from([
                    ("entity", entity_schema()),
                    (entity_type.as_str(), typed_schema()),
                ]),
            },
        );
    }
    envs
}

fn entity_schema() -> FieldSchema {
    FieldSchema::Struct(BTreeMap::from([
        ("id", FieldSchema::Leaf(Kind::String)),
        ("name", FieldSchema::Leaf(Kind::String)),
        ("type", FieldSchema::Leaf(Kind::String)),
        ("provider", FieldSchema::Leaf(Kind::String)),
        ("project", FieldSchema::Leaf(Kind::String)),
    ]))
}

fn typed_schema() -> FieldSchema {
    FieldSchema::Struct(BTreeMap::from([
        ("name", FieldSchema::Leaf(Kind::String)),
        ("provider", FieldSchema::Leaf(Kind::String)),
        ("properties", FieldSchema::Leaf(Kind::Dyn)),
    ]))
}

/// Type-checks an expression in an environment.
///
/// # Errors
///
/// Returns positioned diagnostics; checking continues past the first
/// failure where possible so callers see every problem at once.
pub fn check(expr: &Expr, env: &TypeEnv) -> Result<(), Vec<Diagnostic>> {
    let mut errors = Vec::new();
    let kind = check_expr(expr, env, &mut errors);
    if let Some(kind) = kind {
        if !kind.compatible(Kind::Bool) {
            errors.push(Diagnostic::new(
                expr.span(),
                format!("selector must evaluate to bool, found {}", kind.name()),
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_expr(expr: &Expr, env: &TypeEnv, errors: &mut Vec<Diagnostic>) -> Option<Kind> {
    match expr {
        Expr::Bool(..) => Some(Kind::Bool),
        Expr::Int(..) => Some(Kind::Int),
        Expr::Str(..) => Some(Kind::String),
        Expr::List(items, _) => {
            for item in items {
                check_expr(item, env, errors);
            }
            Some(Kind::List)
        }
        Expr::Path(path) => match env.kind_of_path(&path.segments) {
            Ok(kind) => Some(kind),
            Err(msg) => {
                errors.push(Diagnostic::new(path.span, msg));
                None
            }
        },
        Expr::Not(inner, span) => {
            if let Some(kind) = check_expr(inner, env, errors) {
                if !kind.compatible(Kind::Bool) {
                    errors.push(Diagnostic::new(
                        *span,
                        format!("'!' requires a bool operand, found {}", kind.name()),
                    ));
                }
            }
            Some(Kind::Bool)
        }
        Expr::Binary {
            op,
            lhs,
            rhs,
            span,
        } => {
            let lhs_kind = check_expr(lhs, env, errors);
            let rhs_kind = check_expr(rhs, env, errors);
            match op {
                BinOp::Eq | BinOp::Ne => {
                    if let (Some(l), Some(r)) = (lhs_kind, rhs_kind) {
                        if !l.compatible(r) {
                            errors.push(Diagnostic::new(
                                *span,
                                format!(
                                    "cannot compare {} with {}",
                                    l.name(),
                                    r.name()
                                ),
                            ));
                        }
                    }
                    Some(Kind::Bool)
                }
                BinOp::In => {
                    if let Some(r) = rhs_kind {
                        if !r.compatible(Kind::List) {
                            errors.push(Diagnostic::new(
                                *span,
                                format!("'in' requires a list right-hand side, found {}", r.name()),
                            ));
                        }
                    }
                    Some(Kind::Bool)
                }
                BinOp::And | BinOp::Or => {
                    for kind in [lhs_kind, rhs_kind].into_iter().flatten() {
                        if !kind.compatible(Kind::Bool) {
                            errors.push(Diagnostic::new(
                                *span,
                                format!(
                                    "logical operators require bool operands, found {}",
                                    kind.name()
                                ),
                            ));
                        }
                    }
                    Some(Kind::Bool)
                }
            }
        }
    }
}

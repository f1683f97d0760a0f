//! Evaluated values.
//!
//! `Val` is the result of evaluating an expression. It is `Rc`-based and
//! deliberately not `Send`: evaluated values belong to exactly one thread of
//! control and cross threads only as exported syntax.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::{Expr, Kind, Pos};
use crate::{ErrorKind, EvalError};

/// An evaluated value.
#[derive(Debug, Clone)]
pub enum Val {
    /// `null`
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(Rc<str>),
    /// List.
    List(Rc<Vec<Val>>),
    /// Struct with sorted fields.
    Struct(Rc<StructVal>),
    /// A type atom; not concrete.
    Kind(Kind),
    /// A disjunction that has not collapsed yet; not concrete.
    Disj(Rc<DisjVal>),
}

/// An evaluated struct.
#[derive(Debug)]
pub struct StructVal {
    /// Fields, sorted by label. Definition labels keep their leading `#`.
    pub fields: BTreeMap<String, FieldVal>,
}

/// A single evaluated struct field.
#[derive(Debug, Clone)]
pub struct FieldVal {
    /// The field value.
    pub val: Val,
    /// Whether every declaration of the field was optional.
    pub optional: bool,
    /// Position of the (first) declaration, for diagnostics.
    pub pos: Pos,
}

/// An evaluated disjunction.
#[derive(Debug)]
pub struct DisjVal {
    /// Remaining branches.
    pub branches: Vec<Val>,
    /// Index of the default branch, if one survives.
    pub default: Option<usize>,
}

impl Val {
    /// Type_name reports a short human-readable description of the value's
    /// shape, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Str(_) => "string",
            Val::List(_) => "list",
            Val::Struct(_) => "struct",
            Val::Kind(_) => "type",
            Val::Disj(_) => "disjunction",
        }
    }

    /// Equal reports semantic equality of two concrete values.
    pub fn equal(&self, other: &Val) -> bool {
        match (self, other) {
            (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => {
                #[allow(clippy::cast_precision_loss)]
                let fa = *a as f64;
                fa == *b
            }
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::List(a), Val::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Val::Struct(a), Val::Struct(b)) => {
                a.fields.len() == b.fields.len()
                    && a.fields.iter().zip(b.fields.iter()).all(
                        |((ka, fa), (kb, fb))| ka == kb && fa.val.equal(&fb.val),
                    )
            }
            (Val::Kind(a), Val::Kind(b)) => a == b,
            _ => false,
        }
    }
}

fn conflict(path: &str, msg: String) -> EvalError {
    let ctx = if path.is_empty() {
        msg
    } else {
        format!("{path}: {msg}")
    };
    EvalError::new(ErrorKind::Unify, ctx)
}

fn kind_admits(k: Kind, v: &Val) -> bool {
    match (k, v) {
        (Kind::Any, _) => true,
        (Kind::String, Val::Str(_)) => true,
        (Kind::Int, Val::Int(_)) => true,
        (Kind::Float, Val::Float(_)) => true,
        (Kind::Number, Val::Int(_) | Val::Float(_)) => true,
        (Kind::Bool, Val::Bool(_)) => true,
        _ => false,
    }
}

fn kind_meet(a: Kind, b: Kind) -> Option<Kind> {
    use Kind::*;
    if a == b {
        return Some(a);
    }
    match (a, b) {
        (Any, k) | (k, Any) => Some(k),
        (Number, Int) | (Int, Number) => Some(Int),
        (Number, Float) | (Float, Number) => Some(Float),
        _ => None,
    }
}

/// Unify computes the greatest lower bound of two values, or a conflict
/// error. `path` is the field path for diagnostics.
pub fn unify(a: &Val, b: &Val, path: &str) -> Result<Val, EvalError> {
    match (a, b) {
        (Val::Kind(Kind::Any), v) | (v, Val::Kind(Kind::Any)) => Ok(v.clone()),
        (Val::Kind(k), Val::Kind(j)) => kind_meet(*k, *j).map(Val::Kind).ok_or_else(|| {
            conflict(path, format!("conflicting types `{k}` and `{j}`"))
        }),
        (Val::Kind(k), v) | (v, Val::Kind(k)) => {
            if matches!(v, Val::Disj(_)) {
                return unify_disj(v, &Val::Kind(*k), path);
            }
            if kind_admits(*k, v) {
                Ok(v.clone())
            } else {
                Err(conflict(
                    path,
                    format!("{} value does not satisfy `{k}`", v.type_name()),
                ))
            }
        }
        (Val::Disj(_), _) => unify_disj(a, b, path),
        (_, Val::Disj(_)) => unify_disj(b, a, path),
        (Val::Struct(sa), Val::Struct(sb)) => {
            let mut fields: BTreeMap<String, FieldVal> = BTreeMap::new();
            for (k, f) in sa.fields.iter() {
                fields.insert(k.clone(), f.clone());
            }
            for (k, fb) in sb.fields.iter() {
                match fields.get(k) {
                    Some(fa) => {
                        let sub = if path.is_empty() {
                            k.clone()
                        } else {
                            format!("{path}.{k}")
                        };
                        let merged = unify(&fa.val, &fb.val, &sub)?;
                        fields.insert(
                            k.clone(),
                            FieldVal {
                                val: merged,
                                optional: fa.optional && fb.optional,
                                pos: fa.pos.clone(),
                            },
                        );
                    }
                    None => {
                        fields.insert(k.clone(), fb.clone());
                    }
                }
            }
            Ok(Val::Struct(Rc::new(StructVal { fields })))
        }
        (Val::List(la), Val::List(lb)) => {
            if la.len() != lb.len() {
                return Err(conflict(
                    path,
                    format!("list length mismatch: {} vs {}", la.len(), lb.len()),
                ));
            }
            let mut out = Vec::with_capacity(la.len());
            for (i, (x, y)) in la.iter().zip(lb.iter()).enumerate() {
                let sub = format!("{path}[{i}]");
                out.push(unify(x, y, &sub)?);
            }
            Ok(Val::List(Rc::new(out)))
        }
        _ => {
            if a.equal(b) {
                Ok(a.clone())
            } else {
                Err(conflict(
                    path,
                    format!(
                        "conflicting values ({} vs {})",
                        render_short(a),
                        render_short(b)
                    ),
                ))
            }
        }
    }
}

fn unify_disj(d: &Val, other: &Val, path: &str) -> Result<Val, EvalError> {
    let Val::Disj(d) = d else {
        unreachable!("caller checked")
    };
    let mut branches = Vec::new();
    let mut default = None;
    for (i, b) in d.branches.iter().enumerate() {
        if let Ok(v) = unify(b, other, path) {
            if d.default == Some(i) {
                default = Some(branches.len());
            }
            branches.push(v);
        }
    }
    match branches.len() {
        0 => Err(conflict(
            path,
            format!("no disjunction branch satisfies {}", render_short(other)),
        )),
        1 => Ok(branches.pop().expect("one branch")),
        _ => Ok(Val::Disj(Rc::new(DisjVal { branches, default }))),
    }
}

fn render_short(v: &Val) -> String {
    match v {
        Val::Null => "null".into(),
        Val::Bool(b) => b.to_string(),
        Val::Int(i) => i.to_string(),
        Val::Float(f) => f.to_string(),
        Val::Str(s) => format!("{s:?}"),
        Val::List(_) => "a list".into(),
        Val::Struct(_) => "a struct".into(),
        Val::Kind(k) => format!("`{k}`"),
        Val::Disj(_) => "a disjunction".into(),
    }
}

/// Finalize collapses a value to concrete data: disjunction defaults are
/// taken, optional and definition fields are dropped. Reports the first
/// non-concrete path when `concrete` is set.
pub fn finalize(v: &Val, concrete: bool, path: &str) -> Result<serde_json::Value, EvalError> {
    match v {
        Val::Null => Ok(serde_json::Value::Null),
        Val::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Val::Int(i) => Ok(serde_json::Value::from(*i)),
        Val::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                EvalError::new(ErrorKind::Validate, format!("{path}: non-finite float"))
            }),
        Val::Str(s) => Ok(serde_json::Value::String(s.to_string())),
        Val::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(finalize(item, concrete, &format!("{path}[{i}]"))?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Val::Struct(s) => {
            let mut map = serde_json::Map::new();
            for (k, f) in s.fields.iter() {
                if f.optional || k.starts_with('#') {
                    continue;
                }
                let sub = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                let v = finalize(&f.val, concrete, &sub).map_err(|e| e.with_pos(f.pos.clone()))?;
                map.insert(k.clone(), v);
            }
            Ok(serde_json::Value::Object(map))
        }
        Val::Disj(d) => match d.default {
            Some(i) => finalize(&d.branches[i], concrete, path),
            None if d.branches.len() == 1 => finalize(&d.branches[0], concrete, path),
            None => {
                if concrete {
                    Err(EvalError::new(
                        ErrorKind::Validate,
                        format!("{path}: unresolved disjunction"),
                    ))
                } else {
                    Ok(serde_json::Value::Null)
                }
            }
        },
        Val::Kind(k) => {
            if concrete {
                Err(EvalError::new(
                    ErrorKind::Validate,
                    format!("{path}: incomplete value `{k}`"),
                ))
            } else {
                Ok(serde_json::Value::Null)
            }
        }
    }
}

/// Validate walks the value and reports the first non-concrete regular
/// field when `concrete` is set. Unlike [`finalize`] it does not build the
/// data tree.
pub fn validate(v: &Val, concrete: bool, path: &str) -> Result<(), EvalError> {
    finalize(v, concrete, path).map(|_| ())
}

/// To_expr converts a finalized value into a literal expression for
/// cross-thread transport.
pub fn to_expr(v: &Val, concrete: bool) -> Result<Expr, EvalError> {
    let data = finalize(v, concrete, "")?;
    Ok(Expr::from_json(&data, &Pos::synthetic("<syntax>")))
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match finalize(self, false, "") {
            Ok(data) => write!(f, "{data}"),
            Err(_) => f.write_str(render_short(self).as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Val {
        Val::Str(Rc::from(v))
    }

    #[test]
    fn scalar_unification() {
        assert!(unify(&Val::Int(1), &Val::Int(1), "").is_ok());
        assert!(unify(&Val::Int(1), &Val::Int(2), "").is_err());
        assert!(unify(&s("a"), &Val::Kind(Kind::String), "").is_ok());
        assert!(unify(&s("a"), &Val::Kind(Kind::Int), "").is_err());
    }

    #[test]
    fn disjunction_filtering() {
        let d = Val::Disj(Rc::new(DisjVal {
            branches: vec![Val::Kind(Kind::Int), Val::Int(1)],
            default: Some(1),
        }));
        // The literal branch conflicts and is dropped; only the `int`
        // branch survives, collapsed onto the concrete value.
        let v = unify(&d, &Val::Int(3), "").expect("unify");
        let out = finalize(&v, true, "").expect("finalize");
        assert_eq!(out, serde_json::json!(3));
    }

    #[test]
    fn finalize_drops_optional_and_definitions() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "#schema".to_string(),
            FieldVal {
                val: Val::Kind(Kind::String),
                optional: false,
                pos: Pos::synthetic("<test>"),
            },
        );
        fields.insert(
            "maybe".to_string(),
            FieldVal {
                val: Val::Kind(Kind::Int),
                optional: true,
                pos: Pos::synthetic("<test>"),
            },
        );
        fields.insert(
            "name".to_string(),
            FieldVal {
                val: s("x"),
                optional: false,
                pos: Pos::synthetic("<test>"),
            },
        );
        let v = Val::Struct(Rc::new(StructVal { fields }));
        let out = finalize(&v, true, "").expect("finalize");
        assert_eq!(out, serde_json::json!({"name": "x"}));
    }
}

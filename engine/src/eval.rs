//! Expression evaluation.
//!
//! Structs evaluate as lexical frames: conjoined struct literals are merged
//! into a single frame *before* field evaluation, so a reference written in
//! one conjunct resolves against fields contributed by another. This is what
//! makes `fill`-then-evaluate work for transformer bodies: the body's
//! references to its hidden inputs see the filled data.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ast::{Decl, Expr, Kind, Pos, StrPart};
use crate::value::{unify, DisjVal, FieldVal, StructVal, Val};
use crate::{ErrorKind, EvalError};

/// A field group: every declaration of one label within a frame.
struct Group<'a> {
    exprs: Vec<&'a Expr>,
    optional: bool,
    pos: Pos,
}

/// Memoization cell for a field under evaluation.
enum Cell {
    InProgress,
    Done(Val),
}

/// A lexical frame: one merged struct scope.
struct Frame<'a> {
    groups: BTreeMap<String, Group<'a>>,
    cells: RefCell<BTreeMap<String, Cell>>,
}

/// A scope chain link.
struct Scope<'a> {
    parent: Option<Rc<Scope<'a>>>,
    frame: Rc<Frame<'a>>,
}

/// Eval_root evaluates a root expression (a file or conjunction of files
/// and fills) with no enclosing scope.
pub fn eval_root(root: &Expr) -> Result<Val, EvalError> {
    eval(root, None)
}

fn eval<'a>(e: &'a Expr, env: Option<&Rc<Scope<'a>>>) -> Result<Val, EvalError> {
    match e {
        Expr::Null(_) => Ok(Val::Null),
        Expr::Bool(b, _) => Ok(Val::Bool(*b)),
        Expr::Int(i, _) => Ok(Val::Int(*i)),
        Expr::Float(f, _) => Ok(Val::Float(*f)),
        Expr::Type(k, _) => Ok(Val::Kind(*k)),
        Expr::Str(parts, pos) => eval_str(parts, pos, env),
        Expr::List(items, _) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, env)?);
            }
            Ok(Val::List(Rc::new(out)))
        }
        Expr::Struct(..) | Expr::And(..) => eval_conjuncts(&[e], env),
        Expr::Ref(segs, pos) => eval_ref(segs, pos, env),
        Expr::Or(branches, _) => {
            let mut vals = Vec::with_capacity(branches.len());
            let mut default = None;
            for b in branches {
                if b.default {
                    default = Some(vals.len());
                }
                vals.push(eval(&b.expr, env)?);
            }
            Ok(Val::Disj(Rc::new(DisjVal {
                branches: vals,
                default,
            })))
        }
    }
}

/// Collect_decls flattens struct literals and conjunctions of struct
/// literals into one declaration list. Returns false if the expression is
/// not "structish" and must be evaluated on its own.
fn collect_decls<'a>(e: &'a Expr, out: &mut Vec<&'a Decl>) -> bool {
    match e {
        Expr::Struct(decls, _) => {
            out.extend(decls.iter());
            true
        }
        Expr::And(a, b) => {
            let mut tmp = Vec::new();
            if collect_decls(a, &mut tmp) && collect_decls(b, &mut tmp) {
                out.append(&mut tmp);
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Eval_conjuncts evaluates a set of expressions that all constrain the
/// same value. Struct literals are merged into a single frame; anything
/// else is evaluated separately and unified value-wise.
fn eval_conjuncts<'a>(
    exprs: &[&'a Expr],
    env: Option<&Rc<Scope<'a>>>,
) -> Result<Val, EvalError> {
    let mut decls: Vec<&'a Decl> = Vec::new();
    let mut loose: Vec<&'a Expr> = Vec::new();
    for &e in exprs {
        match e {
            Expr::And(a, b) => {
                for side in [a.as_ref(), b.as_ref()] {
                    let mut tmp = Vec::new();
                    if collect_decls(side, &mut tmp) {
                        decls.append(&mut tmp);
                    } else {
                        loose.push(side);
                    }
                }
            }
            Expr::Struct(ds, _) => decls.extend(ds.iter()),
            other => loose.push(other),
        }
    }

    let mut acc: Option<Val> = None;
    if !decls.is_empty() {
        acc = Some(eval_frame(decls, env)?);
    }
    for e in loose {
        let v = eval(e, env)?;
        acc = Some(match acc {
            None => v,
            Some(prev) => unify(&prev, &v, "").map_err(|err| err.with_pos(e.pos()))?,
        });
    }
    acc.map_or_else(|| Ok(Val::Struct(Rc::new(StructVal { fields: BTreeMap::new() }))), Ok)
}

fn eval_frame<'a>(
    decls: Vec<&'a Decl>,
    env: Option<&Rc<Scope<'a>>>,
) -> Result<Val, EvalError> {
    let mut groups: BTreeMap<String, Group<'a>> = BTreeMap::new();
    for d in decls {
        let g = groups.entry(d.label.clone()).or_insert_with(|| Group {
            exprs: Vec::new(),
            optional: true,
            pos: d.pos.clone(),
        });
        g.exprs.push(&d.value);
        g.optional = g.optional && d.optional;
    }
    let frame = Rc::new(Frame {
        groups,
        cells: RefCell::new(BTreeMap::new()),
    });
    let scope = Rc::new(Scope {
        parent: env.cloned(),
        frame: frame.clone(),
    });

    let labels: Vec<String> = frame.groups.keys().cloned().collect();
    let mut fields = BTreeMap::new();
    for label in labels {
        let val = force_field(&scope, &label)?;
        let g = &frame.groups[&label];
        fields.insert(
            label.clone(),
            FieldVal {
                val,
                optional: g.optional,
                pos: g.pos.clone(),
            },
        );
    }
    Ok(Val::Struct(Rc::new(StructVal { fields })))
}

fn force_field<'a>(scope: &Rc<Scope<'a>>, label: &str) -> Result<Val, EvalError> {
    {
        let cells = scope.frame.cells.borrow();
        match cells.get(label) {
            Some(Cell::Done(v)) => return Ok(v.clone()),
            Some(Cell::InProgress) => {
                let pos = scope.frame.groups[label].pos.clone();
                return Err(EvalError::new(
                    ErrorKind::Build,
                    format!("cycle detected while evaluating `{label}`"),
                )
                .with_pos(pos));
            }
            None => {}
        }
    }
    scope
        .frame
        .cells
        .borrow_mut()
        .insert(label.to_string(), Cell::InProgress);

    let g = &scope.frame.groups[label];
    let exprs: Vec<&'a Expr> = g.exprs.clone();
    let res = eval_conjuncts(&exprs, Some(scope));

    match res {
        Ok(v) => {
            scope
                .frame
                .cells
                .borrow_mut()
                .insert(label.to_string(), Cell::Done(v.clone()));
            Ok(v)
        }
        Err(e) => {
            scope.frame.cells.borrow_mut().remove(label);
            Err(if e.has_pos() { e } else { e.with_pos(g.pos.clone()) })
        }
    }
}

fn eval_ref<'a>(
    segs: &[String],
    pos: &Pos,
    env: Option<&Rc<Scope<'a>>>,
) -> Result<Val, EvalError> {
    let head = &segs[0];
    let mut cursor = env;
    let mut base = None;
    while let Some(scope) = cursor {
        if scope.frame.groups.contains_key(head) {
            base = Some(force_field(scope, head)?);
            break;
        }
        cursor = scope.parent.as_ref();
    }
    let Some(mut val) = base else {
        return Err(EvalError::new(
            ErrorKind::Build,
            format!("reference to undefined field `{head}`"),
        )
        .with_pos(pos.clone()));
    };
    for seg in &segs[1..] {
        val = select(&val, seg, pos)?;
    }
    Ok(val)
}

/// Select navigates one step into a value. Selecting into `_` yields `_`
/// so that constraints referencing not-yet-filled inputs stay incomplete
/// instead of failing.
pub fn select(val: &Val, seg: &str, pos: &Pos) -> Result<Val, EvalError> {
    match val {
        Val::Struct(s) => s.fields.get(seg).map(|f| f.val.clone()).ok_or_else(|| {
            EvalError::new(ErrorKind::Build, format!("field not found: `{seg}`"))
                .with_pos(pos.clone())
        }),
        Val::Kind(Kind::Any) => Ok(Val::Kind(Kind::Any)),
        Val::Disj(d) => {
            if let Some(i) = d.default {
                select(&d.branches[i], seg, pos)
            } else if d.branches.len() == 1 {
                select(&d.branches[0], seg, pos)
            } else {
                Err(EvalError::new(
                    ErrorKind::Build,
                    format!("cannot select `{seg}` from an unresolved disjunction"),
                )
                .with_pos(pos.clone()))
            }
        }
        other => Err(EvalError::new(
            ErrorKind::Build,
            format!("cannot select `{seg}` from {}", other.type_name()),
        )
        .with_pos(pos.clone())),
    }
}

fn eval_str<'a>(
    parts: &'a [StrPart],
    pos: &Pos,
    env: Option<&Rc<Scope<'a>>>,
) -> Result<Val, EvalError> {
    let mut out = String::new();
    for p in parts {
        match p {
            StrPart::Lit(s) => out.push_str(s),
            StrPart::Interp(e) => match eval(e, env)? {
                Val::Str(s) => out.push_str(&s),
                Val::Int(i) => out.push_str(&i.to_string()),
                Val::Float(f) => out.push_str(&f.to_string()),
                Val::Bool(b) => out.push_str(&b.to_string()),
                // A not-yet-concrete part makes the whole string
                // incomplete rather than an error; it resolves once the
                // referenced input is filled.
                Val::Kind(_) | Val::Disj(_) => return Ok(Val::Kind(Kind::String)),
                other => {
                    return Err(EvalError::new(
                        ErrorKind::Build,
                        format!("cannot interpolate {}", other.type_name()),
                    )
                    .with_pos(pos.clone()));
                }
            },
        }
    }
    Ok(Val::Str(Rc::from(out.as_str())))
}

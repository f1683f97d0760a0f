//! Syntax tree for the configuration language.
//!
//! The tree is plain owned data (`Arc<str>` for interned file names) and is
//! `Send + Sync`; it is the only form in which configuration crosses thread
//! boundaries.

use std::fmt;
use std::sync::Arc;

/// Source position of a token or expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
    /// Originating file. Synthetic values use a pseudo-filename in angle
    /// brackets, e.g. `<fill>`.
    pub file: Arc<str>,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

impl Pos {
    /// Synthetic returns a position for values that have no source text.
    pub fn synthetic(label: &str) -> Pos {
        Pos {
            file: Arc::from(label),
            line: 0,
            col: 0,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.col)
        }
    }
}

/// Basic (non-composite) type atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `_`, the top type.
    Any,
    /// `string`
    String,
    /// `int`
    Int,
    /// `float`
    Float,
    /// `number` (int or float)
    Number,
    /// `bool`
    Bool,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Any => "_",
            Kind::String => "string",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Number => "number",
            Kind::Bool => "bool",
        })
    }
}

/// A string literal part: either literal text or an interpolated expression.
#[derive(Debug, Clone)]
pub enum StrPart {
    /// Literal text.
    Lit(String),
    /// `\(expr)` interpolation.
    Interp(Box<Expr>),
}

/// A disjunction branch; `default` is set for `*expr`.
#[derive(Debug, Clone)]
pub struct Branch {
    /// The branch expression.
    pub expr: Expr,
    /// Whether the branch was marked as the default with `*`.
    pub default: bool,
}

/// A field declaration inside a struct body.
#[derive(Debug, Clone)]
pub struct Decl {
    /// Field label. Definitions keep their leading `#`.
    pub label: String,
    /// Whether the field was declared optional (`label?:`).
    pub optional: bool,
    /// The field value.
    pub value: Expr,
    /// Position of the label.
    pub pos: Pos,
}

/// An expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// `null`
    Null(Pos),
    /// `true` / `false`
    Bool(bool, Pos),
    /// Integer literal.
    Int(i64, Pos),
    /// Float literal.
    Float(f64, Pos),
    /// String literal, possibly with interpolations.
    Str(Vec<StrPart>, Pos),
    /// Type atom.
    Type(Kind, Pos),
    /// Struct literal.
    Struct(Vec<Decl>, Pos),
    /// List literal.
    List(Vec<Expr>, Pos),
    /// Reference: a dotted path, first segment resolved lexically.
    Ref(Vec<String>, Pos),
    /// Conjunction `a & b`.
    And(Box<Expr>, Box<Expr>),
    /// Disjunction `a | b | *c`.
    Or(Vec<Branch>, Pos),
}

impl Expr {
    /// Pos reports the position of the expression.
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Null(p)
            | Expr::Bool(_, p)
            | Expr::Int(_, p)
            | Expr::Float(_, p)
            | Expr::Str(_, p)
            | Expr::Type(_, p)
            | Expr::Struct(_, p)
            | Expr::List(_, p)
            | Expr::Ref(_, p)
            | Expr::Or(_, p) => p.clone(),
            Expr::And(a, _) => a.pos(),
        }
    }

    /// From_json converts plain data into a literal expression.
    ///
    /// Numbers that do not fit an `i64` are represented as floats.
    pub fn from_json(v: &serde_json::Value, pos: &Pos) -> Expr {
        match v {
            serde_json::Value::Null => Expr::Null(pos.clone()),
            serde_json::Value::Bool(b) => Expr::Bool(*b, pos.clone()),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Expr::Int(i, pos.clone())
                } else {
                    Expr::Float(n.as_f64().unwrap_or(f64::NAN), pos.clone())
                }
            }
            serde_json::Value::String(s) => {
                Expr::Str(vec![StrPart::Lit(s.clone())], pos.clone())
            }
            serde_json::Value::Array(items) => Expr::List(
                items.iter().map(|v| Expr::from_json(v, pos)).collect(),
                pos.clone(),
            ),
            serde_json::Value::Object(map) => Expr::Struct(
                map.iter()
                    .map(|(k, v)| Decl {
                        label: k.clone(),
                        optional: false,
                        value: Expr::from_json(v, pos),
                        pos: pos.clone(),
                    })
                    .collect(),
                pos.clone(),
            ),
        }
    }

    /// Wrap nests `self` under the given path, producing
    /// `{a: {b: self}}` for path `["a", "b"]`.
    pub fn wrap(self, path: &[String], pos: &Pos) -> Expr {
        path.iter().rev().fold(self, |inner, seg| {
            Expr::Struct(
                vec![Decl {
                    label: seg.clone(),
                    optional: false,
                    value: inner,
                    pos: pos.clone(),
                }],
                pos.clone(),
            )
        })
    }
}

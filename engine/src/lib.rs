#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Engine implements the configuration-language evaluator and the narrow
//! facade the rest of the system uses to drive it.
//!
//! A [`Context`] owns evaluation for one thread of control; it is
//! intentionally not `Send`. Values never cross threads by reference: export
//! an [`Ast`] with [`Value::syntax`] and rebuild it in the receiving
//! thread's own context with [`Context::build_expr`].

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

pub mod ast;
mod eval;
mod lexer;
mod parser;
mod value;

use ast::{Expr, Pos};
use value::Val;

pub use ast::Kind;

/// REGISTRY_ENV is the environment variable naming the module registry
/// consulted while loading packages with external dependencies.
pub const REGISTRY_ENV: &str = "OPM_REGISTRY";

/// ErrorKind classifies an [`EvalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reading source files failed.
    Load,
    /// Evaluation failed (unresolved reference, cycle, missing field).
    Build,
    /// Lexing or parsing failed.
    Compile,
    /// Unification conflict.
    Unify,
    /// Concreteness or schema validation failed.
    Validate,
    /// Decoding into a host type failed.
    Decode,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            ErrorKind::Load => "load error",
            ErrorKind::Build => "build error",
            ErrorKind::Compile => "compile error",
            ErrorKind::Unify => "unify error",
            ErrorKind::Validate => "validation error",
            ErrorKind::Decode => "decode error",
        })
    }
}

/// EvalError is the error domain for every engine operation. Positions are
/// surfaced verbatim; users need file:line:col.
#[derive(Debug)]
pub struct EvalError {
    kind: ErrorKind,
    msg: String,
    positions: Vec<Pos>,
}

impl EvalError {
    pub(crate) fn new<S: ToString>(kind: ErrorKind, msg: S) -> EvalError {
        EvalError {
            kind,
            msg: msg.to_string(),
            positions: Vec::new(),
        }
    }

    pub(crate) fn with_pos(mut self, pos: Pos) -> EvalError {
        if !self.positions.contains(&pos) {
            self.positions.push(pos);
        }
        self
    }

    pub(crate) fn has_pos(&self) -> bool {
        !self.positions.is_empty()
    }

    /// Validation constructs a validation-kind error for callers layering
    /// their own checks on top of the engine.
    pub fn validation<S: ToString>(msg: S) -> EvalError {
        EvalError::new(ErrorKind::Validate, msg)
    }

    /// Kind reports the error classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Positions reports every source position attached to the error.
    pub fn positions(&self) -> impl Iterator<Item = String> + '_ {
        self.positions.iter().map(|p| p.to_string())
    }

    fn reclassify(mut self, kind: ErrorKind) -> EvalError {
        self.kind = kind;
        self
    }
}

impl Display for EvalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}: {}", self.kind, self.msg)?;
        for p in &self.positions {
            if p.line != 0 {
                write!(f, " (at {p})")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {}

/// Result typedef for engine operations.
pub type Result<T, E = EvalError> = std::result::Result<T, E>;

/// Ast is an exported, self-contained data-literal syntax tree. Unlike
/// [`Value`] it is `Send + Sync` and may cross thread boundaries.
#[derive(Debug, Clone)]
pub struct Ast {
    expr: Arc<Expr>,
}

/// RegistryGuard sets [`REGISTRY_ENV`] for the duration of a load and
/// restores the previous state on all exit paths when dropped.
pub struct RegistryGuard {
    prev: Option<std::ffi::OsString>,
}

impl RegistryGuard {
    /// Set installs `registry` as the process-wide registry override.
    pub fn set(registry: &str) -> RegistryGuard {
        let prev = std::env::var_os(REGISTRY_ENV);
        debug!(registry, "setting module registry");
        // SAFETY: the process is effectively single-threaded while loads
        // run; the guard restores the prior state before anything else
        // reads the variable.
        unsafe { std::env::set_var(REGISTRY_ENV, registry) };
        RegistryGuard { prev }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        // SAFETY: see `set`.
        unsafe {
            match self.prev.take() {
                Some(v) => std::env::set_var(REGISTRY_ENV, v),
                None => std::env::remove_var(REGISTRY_ENV),
            }
        }
    }
}

/// Context is an evaluation context. One per thread of control, always.
#[derive(Clone, Default)]
pub struct Context {
    // Rc keeps the context (and every Value it produces) !Send.
    _not_send: PhantomData<Rc<()>>,
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("ctx")
    }
}

impl Context {
    /// New creates a fresh context.
    pub fn new() -> Context {
        Context::default()
    }

    /// Compile parses `src` into a value, attributing positions to
    /// `filename`.
    pub fn compile(&self, src: &str, filename: &str) -> Result<Value> {
        let mut p = parser::Parser::new(src, Arc::from(filename))?;
        let file = p.file()?;
        Ok(Value {
            ctx: self.clone(),
            root: Arc::new(file),
            path: Vec::new(),
            package: p.package,
        })
    }

    /// Load_files reads and parses the given files and conjoins them into a
    /// single package value. All files must agree on their `package`
    /// clause.
    pub fn load_files(&self, files: &[PathBuf]) -> Result<Value> {
        if files.is_empty() {
            return Err(EvalError::new(ErrorKind::Load, "no configuration files"));
        }
        let mut package: Option<String> = None;
        let mut root: Option<Expr> = None;
        for path in files {
            let src = std::fs::read_to_string(path).map_err(|e| {
                EvalError::new(ErrorKind::Load, format!("{}: {e}", path.display()))
            })?;
            let name = path.to_string_lossy();
            let mut p = parser::Parser::new(&src, Arc::from(name.as_ref()))?;
            let file = p.file()?;
            trace!(file = %path.display(), package = ?p.package, "parsed");
            match (&package, &p.package) {
                (None, got) => package = got.clone(),
                (Some(want), Some(got)) if want != got => {
                    return Err(EvalError::new(
                        ErrorKind::Load,
                        format!("conflicting package names `{want}` and `{got}`"),
                    )
                    .with_pos(Pos {
                        file: Arc::from(name.as_ref()),
                        line: 1,
                        col: 1,
                    }));
                }
                _ => {}
            }
            root = Some(match root {
                None => file,
                Some(prev) => Expr::And(Box::new(prev), Box::new(file)),
            });
        }
        Ok(Value {
            ctx: self.clone(),
            root: Arc::new(root.expect("at least one file")),
            path: Vec::new(),
            package,
        })
    }

    /// Load_dir loads every top-level `.cue` file in `dir` except the names
    /// in `exclude`, sorted for determinism.
    pub fn load_dir(&self, dir: &Path, exclude: &[&str]) -> Result<Value> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| EvalError::new(ErrorKind::Load, format!("{}: {e}", dir.display())))?
            .filter_map(|ent| ent.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension().is_some_and(|e| e == "cue")
                    && !p
                        .file_name()
                        .is_some_and(|n| exclude.iter().any(|x| n == std::ffi::OsStr::new(x)))
            })
            .collect();
        files.sort();
        self.load_files(&files)
    }

    /// Encode serializes a host value into a concrete configuration value.
    pub fn encode<T: Serialize>(&self, v: &T) -> Result<Value> {
        let data = serde_json::to_value(v)
            .map_err(|e| EvalError::new(ErrorKind::Decode, e.to_string()))?;
        Ok(self.from_json(&data))
    }

    /// From_json wraps plain data as a concrete value.
    pub fn from_json(&self, data: &serde_json::Value) -> Value {
        Value {
            ctx: self.clone(),
            root: Arc::new(Expr::from_json(data, &Pos::synthetic("<encode>"))),
            path: Vec::new(),
            package: None,
        }
    }

    /// Build_expr rebuilds an exported [`Ast`] as a value owned by this
    /// context.
    pub fn build_expr(&self, ast: &Ast) -> Value {
        Value {
            ctx: self.clone(),
            root: ast.expr.clone(),
            path: Vec::new(),
            package: None,
        }
    }
}

/// Value is an immutable handle on a (possibly incomplete) configuration
/// value: a root syntax tree plus a focus path. Every operation returns a
/// new handle; the original is never mutated.
#[derive(Clone)]
pub struct Value {
    ctx: Context,
    root: Arc<Expr>,
    path: Vec<String>,
    package: Option<String>,
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "value@{}", self.path.join("."))
    }
}

impl Value {
    /// Package reports the `package` clause of the loaded files, if any.
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    fn eval_focus(&self) -> Result<Val> {
        let root = eval::eval_root(&self.root)?;
        let pos = Pos::synthetic("<lookup>");
        let mut val = root;
        for seg in &self.path {
            val = eval::select(&val, seg, &pos)?;
        }
        Ok(val)
    }

    /// Lookup navigates to a sub-value. `Ok(None)` is reported when a path
    /// segment does not exist; evaluation failures are errors.
    pub fn lookup(&self, path: &[&str]) -> Result<Option<Value>> {
        let mut val = self.eval_focus()?;
        for seg in path {
            match &val {
                Val::Struct(s) => match s.fields.get(*seg) {
                    Some(f) => val = f.val.clone(),
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        let mut full = self.path.clone();
        full.extend(path.iter().map(|s| s.to_string()));
        Ok(Some(Value {
            ctx: self.ctx.clone(),
            root: self.root.clone(),
            path: full,
            package: self.package.clone(),
        }))
    }

    /// Fields reports the labels of a struct value, sorted. Definition
    /// labels keep their leading `#`.
    pub fn fields(&self) -> Result<Vec<String>> {
        match self.eval_focus()? {
            Val::Struct(s) => Ok(s.fields.keys().cloned().collect()),
            other => Err(EvalError::new(
                ErrorKind::Build,
                format!("not a struct: {}", other.type_name()),
            )),
        }
    }

    /// Fill returns a new value with `other` (which must be concrete)
    /// unified in at `path` below the focus. The receiver is unchanged.
    pub fn fill(&self, path: &[&str], other: &Value) -> Result<Value> {
        let data = other.to_json(true)?;
        Ok(self.fill_json(path, &data))
    }

    /// Fill_json is [`Value::fill`] for plain data.
    pub fn fill_json(&self, path: &[&str], data: &serde_json::Value) -> Value {
        let pos = Pos::synthetic("<fill>");
        let mut full: Vec<String> = self.path.clone();
        full.extend(path.iter().map(|s| s.to_string()));
        let lit = Expr::from_json(data, &pos).wrap(&full, &pos);
        Value {
            ctx: self.ctx.clone(),
            root: Arc::new(Expr::And(Box::new((*self.root).clone()), Box::new(lit))),
            path: self.path.clone(),
            package: self.package.clone(),
        }
    }

    /// Unify returns the conjunction of the receiver and `other` at the
    /// receiver's focus. `other` must be concrete.
    pub fn unify(&self, other: &Value) -> Result<Value> {
        self.fill(&[], other)
    }

    /// Validate checks the value evaluates cleanly; with `concrete` set it
    /// additionally requires every regular field to be concrete.
    pub fn validate(&self, concrete: bool) -> Result<()> {
        let val = self.eval_focus()?;
        value::validate(&val, concrete, &self.path.join("."))
    }

    /// Validate_against checks the receiver (concrete data) against a
    /// schema value: every field must exist in the schema, and values must
    /// unify with the schema's constraints.
    pub fn validate_against(&self, schema: &Value) -> Result<()> {
        let data = self.eval_focus()?;
        let schema = schema.eval_focus()?;
        check_schema(&data, &schema, "")
    }

    /// To_json finalizes the value to plain data. Optional fields and
    /// definitions are dropped; disjunctions collapse to their defaults.
    pub fn to_json(&self, concrete: bool) -> Result<serde_json::Value> {
        let val = self.eval_focus()?;
        value::finalize(&val, concrete, &self.path.join("."))
    }

    /// Decode finalizes the value and deserializes it into a host type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.to_json(true)?;
        serde_json::from_value(data).map_err(|e| EvalError::new(ErrorKind::Decode, e.to_string()))
    }

    /// Accepts reports whether plain data unifies with the receiver when
    /// the receiver is read as a constraint. Evaluation failures propagate;
    /// a unification conflict is `Ok(false)`.
    pub fn accepts(&self, data: &serde_json::Value) -> Result<bool> {
        let constraint = self.eval_focus()?;
        let lit = eval::eval_root(&Expr::from_json(data, &Pos::synthetic("<accepts>")))?;
        Ok(value::unify(&constraint, &lit, "").is_ok())
    }

    /// Accepts_value is [`Value::accepts`] for another engine value.
    pub fn accepts_value(&self, other: &Value) -> Result<bool> {
        let constraint = self.eval_focus()?;
        let candidate = other.eval_focus()?;
        Ok(value::unify(&constraint, &candidate, "").is_ok())
    }

    /// Syntax exports the finalized value as a self-contained [`Ast`] for
    /// cross-thread transport.
    pub fn syntax(&self, concrete: bool) -> Result<Ast> {
        let val = self.eval_focus()?;
        let expr = value::to_expr(&val, concrete)?;
        Ok(Ast {
            expr: Arc::new(expr),
        })
    }
}

/// Check_schema verifies `data` against `schema`: unknown fields are
/// rejected (schemas are closed), known fields must unify.
fn check_schema(data: &Val, schema: &Val, path: &str) -> Result<()> {
    match (data, schema) {
        (Val::Struct(d), Val::Struct(s)) => {
            for (k, f) in d.fields.iter() {
                let sub = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                match s.fields.get(k) {
                    Some(sf) => check_schema(&f.val, &sf.val, &sub)?,
                    None => {
                        return Err(EvalError::new(
                            ErrorKind::Validate,
                            format!("field not allowed by schema: {sub}"),
                        )
                        .with_pos(f.pos.clone()));
                    }
                }
            }
            Ok(())
        }
        _ => value::unify(data, schema, path)
            .map(|_| ())
            .map_err(|e| e.reclassify(ErrorKind::Validate)),
    }
}

#[allow(unused)]
fn _assert_ast_is_send(a: Ast) -> impl Send {
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_does_not_mutate_the_receiver() {
        let ctx = Context::new();
        let base = ctx
            .compile(
                "#config: { image: string | *\"nginx\" }\nspec: { image: #config.image }",
                "<t>",
            )
            .expect("compile");
        let filled = base.fill_json(&["#config"], &serde_json::json!({"image": "app:2"}));
        let got = filled.to_json(true).expect("finalize filled");
        assert_eq!(got["spec"]["image"], serde_json::json!("app:2"));
        // The original still reports the schema default.
        let orig = base.to_json(true).expect("finalize original");
        assert_eq!(orig["spec"]["image"], serde_json::json!("nginx"));
    }

    #[test]
    fn syntax_round_trips_across_contexts() {
        let ctx = Context::new();
        let v = ctx
            .compile("name: \"blog\"\nout: { full: \"\\(name)-web\" }", "<t>")
            .expect("compile");
        let ast = v.syntax(true).expect("syntax");
        // A second context plays the role of a worker thread.
        let worker = Context::new();
        let rebuilt = worker.build_expr(&ast);
        assert_eq!(
            rebuilt.to_json(true).expect("decode"),
            v.to_json(true).expect("decode"),
        );
    }

    #[test]
    fn lookup_missing_is_none() {
        let ctx = Context::new();
        let v = ctx.compile("a: { b: 1 }", "<t>").expect("compile");
        assert!(v.lookup(&["a", "b"]).expect("lookup").is_some());
        assert!(v.lookup(&["a", "nope"]).expect("lookup").is_none());
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let ctx = Context::new();
        let schema = ctx
            .compile("#config: { image: string, replicas: int | *1 }", "<t>")
            .expect("compile")
            .lookup(&["#config"])
            .expect("lookup")
            .expect("present");
        let ok = ctx.from_json(&serde_json::json!({"image": "app:1"}));
        ok.validate_against(&schema).expect("valid");
        let bad = ctx.from_json(&serde_json::json!({"imgae": "app:1"}));
        let err = bad.validate_against(&schema).expect_err("unknown field");
        assert!(err.to_string().contains("imgae"), "got: {err}");
    }

    #[test]
    fn load_dir_skips_excluded_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.cue"), "package t\na: 1").expect("write");
        std::fs::write(dir.path().join("values.cue"), "package t\nvalues: {}").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");
        let ctx = Context::new();
        let v = ctx.load_dir(dir.path(), &["values.cue"]).expect("load");
        assert_eq!(v.package(), Some("t"));
        assert!(v.lookup(&["values"]).expect("lookup").is_none());
        assert!(v.lookup(&["a"]).expect("lookup").is_some());
    }

    #[test]
    fn registry_guard_restores_environment() {
        let before = std::env::var(REGISTRY_ENV).ok();
        {
            let _g = RegistryGuard::set("registry.example.com");
            assert_eq!(
                std::env::var(REGISTRY_ENV).ok().as_deref(),
                Some("registry.example.com")
            );
        }
        assert_eq!(std::env::var(REGISTRY_ENV).ok(), before);
    }
}

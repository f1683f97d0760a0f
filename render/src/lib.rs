#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Render implements the pipeline from module directory to concrete
//! resources: loading, values reconciliation, provider selection,
//! component/transformer matching, and transformer execution.

pub mod executor;
pub mod matcher;
pub mod module;
pub mod provider;
pub mod release;

pub use executor::{ExecuteOutcome, execute};
pub use matcher::{Match, MatchDetail, MatchPlan, match_components};
pub use module::{Component, Module};
pub use provider::{Provider, ProviderSource, Transformer};
pub use release::{BuildOptions, Release, build};

/// Error enumerates the failures of the render pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The directory is not a module (missing the module marker).
    #[error("not a module: {0} (missing cue.mod/module.cue)")]
    NotAModule(String),
    /// The evaluator reported an error; positions are preserved.
    #[error(transparent)]
    Eval(#[from] engine::EvalError),
    /// User-supplied values do not satisfy the module's `#config` schema.
    #[error("values validation failed: {0}")]
    ValuesValidation(engine::EvalError),
    /// An overlay layer is not a struct of concrete values.
    #[error("values file {file} is not a concrete mapping: {cause}")]
    ValuesNotConcrete {
        /// Offending overlay file.
        file: String,
        /// Underlying evaluator error.
        cause: engine::EvalError,
    },
    /// A component is not concrete after values were filled in.
    #[error("component `{component}` is not concrete: {cause}")]
    ReleaseValidation {
        /// Offending component.
        component: String,
        /// Underlying evaluator error, carrying the field path.
        cause: engine::EvalError,
    },
    /// A component violates a structural invariant.
    #[error("invalid component `{component}`: {reason}")]
    InvalidComponent {
        /// Offending component.
        component: String,
        /// What was wrong.
        reason: String,
    },
    /// No namespace was given and the module declares no default.
    #[error("namespace required: pass --namespace or set metadata.defaultNamespace")]
    NamespaceRequired,
    /// Provider selection or parsing failed.
    #[error("provider error: {0}")]
    Provider(String),
    /// A component matched no transformer.
    #[error("component `{component}` matched no transformer; available: {available}")]
    UnmatchedComponent {
        /// Offending component.
        component: String,
        /// Transformer FQNs with their requirements, for diagnosis.
        available: String,
    },
    /// A trait is declared on a component but handled by no matched
    /// transformer. Only an error in strict mode.
    #[error("unhandled traits on component `{component}`: {traits}")]
    UnhandledTrait {
        /// Offending component.
        component: String,
        /// The unhandled trait FQNs, comma separated.
        traits: String,
    },
    /// A transformer failed to unify or its output failed to decode.
    #[error("transform {transformer} failed for component `{component}`: {cause}")]
    Transform {
        /// Transformer FQN.
        transformer: String,
        /// Component name.
        component: String,
        /// Underlying error.
        cause: engine::EvalError,
    },
    /// OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result typedef for the render pipeline.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Cli implements the `opm` binary: the command surface plus the
//! inventory-backed reconcile operations (apply, diff, delete, status).

pub mod apply;
pub mod build;
pub mod cluster;
pub mod config;
pub mod delete;
pub mod diff;
pub mod inventory;
pub mod status;

/// Prelude is the common imports for command modules.
pub(crate) mod prelude {
    pub use std::collections::BTreeMap;
    pub use std::time::Duration;

    pub use serde_json::json;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use model::inventory::{InventoryEntry, InventoryPayload, ReleaseRef};
    pub use model::{Gvk, ReleaseMetadata, Resource};

    pub use crate::cluster::{ClusterClient, ClusterError, DeleteOutcome};
    pub use crate::inventory::InventoryStore;
    pub use crate::{Error, Result};
}

/// Error enumerates the failures of the command layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Render pipeline failure.
    #[error(transparent)]
    Render(#[from] render::Error),
    /// One or more render errors, collected fail-on-end.
    #[error("render failed with {} error(s)", .0.len())]
    RenderFailed(Vec<render::Error>),
    /// Cluster operation failure.
    #[error(transparent)]
    Cluster(#[from] crate::cluster::ClusterError),
    /// The release was not found on the cluster.
    #[error("release not found: {0}")]
    ReleaseNotFound(String),
    /// Resources did not become ready before the deadline.
    #[error("timed out waiting for: {0}")]
    WaitTimeout(String),
    /// The inventory payload is malformed.
    #[error("corrupt inventory for release {release}: {cause}")]
    CorruptInventory {
        /// Release name.
        release: String,
        /// What failed to parse.
        cause: String,
    },
    /// CLI configuration problem.
    #[error("config error: {0}")]
    Config(String),
    /// OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// YAML serialization failed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// Tokio task error.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for the command layer.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exit codes are part of the CLI contract.
pub mod exit {
    /// Success.
    pub const OK: i32 = 0;
    /// General error.
    pub const GENERAL: i32 = 1;
    /// Validation failure or resources not ready.
    pub const NOT_READY: i32 = 2;
    /// Cluster connectivity failure.
    pub const CONNECTIVITY: i32 = 3;
    /// Permission denied.
    pub const PERMISSION: i32 = 4;
    /// Release, inventory, or resource not found.
    pub const NOT_FOUND: i32 = 5;
}

impl Error {
    /// Exit_code maps an error to the CLI exit code contract.
    pub fn exit_code(&self) -> i32 {
        use crate::cluster::ClusterError;
        match self {
            Error::Render(_) | Error::RenderFailed(_) => exit::NOT_READY,
            Error::Cluster(ClusterError::Connectivity(_)) => exit::CONNECTIVITY,
            Error::Cluster(ClusterError::PermissionDenied(_)) => exit::PERMISSION,
            Error::Cluster(ClusterError::NotFound(_)) => exit::NOT_FOUND,
            Error::ReleaseNotFound(_) => exit::NOT_FOUND,
            Error::WaitTimeout(_) => exit::NOT_READY,
            _ => exit::GENERAL,
        }
    }
}

/// DEFAULT_TIMEOUT bounds every cluster operation unless overridden.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

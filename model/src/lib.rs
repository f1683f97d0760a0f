#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Model holds the shared data model: metadata records, rendered resources,
//! inventory entries, and the label and identity contracts every other
//! crate builds on.

use std::collections::BTreeMap;

pub mod inventory;
pub mod meta;
pub mod resource;

pub use meta::{ModuleMetadata, ReleaseMetadata, TransformerContext};
pub use resource::{Gvk, Resource};

/// MANAGED_BY is the value of the `app.kubernetes.io/managed-by` label on
/// every applied resource.
pub const MANAGED_BY: &str = "open-platform-model";

/// INVENTORY_MANAGED_BY marks the inventory object itself.
pub const INVENTORY_MANAGED_BY: &str = "opm";

/// FIELD_MANAGER is the server-side-apply field manager name.
pub const FIELD_MANAGER: &str = "opm";

/// LIST_OUTPUT_ANNOTATION marks a component whose transformer output is an
/// ordered list of resources instead of a single one.
pub const LIST_OUTPUT_ANNOTATION: &str = "transformer.opmodel.dev/list-output";

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Release_label returns the argument as a name in the release label space.
pub fn release_label<S: AsRef<str>>(s: S) -> String {
    keyify("release.opmodel.dev/", s)
}

/// Component_label returns the argument as a name in the component label
/// space.
pub fn component_label<S: AsRef<str>>(s: S) -> String {
    keyify("component.opmodel.dev/", s)
}

/// Module_release_label returns the argument as a name in the
/// module-release label space.
pub fn module_release_label<S: AsRef<str>>(s: S) -> String {
    keyify("module-release.opmodel.dev/", s)
}

/// K8s_label returns the argument as a name in the "app.kubernetes.io"
/// space.
pub fn k8s_label<S: AsRef<str>>(s: S) -> String {
    keyify("app.kubernetes.io/", s)
}

/// Tracking_labels is the full label set stamped on every applied resource;
/// downstream discovery depends on this exact contract.
pub fn tracking_labels(
    release: &ReleaseMetadata,
    component: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (k8s_label("managed-by"), MANAGED_BY.to_string()),
        (k8s_label("name"), component.to_string()),
        (k8s_label("version"), release.version.clone()),
        (
            k8s_label("instance"),
            format!("{}-{}", release.name, release.namespace),
        ),
        (release_label("name"), release.name.clone()),
        (release_label("id"), release.identity.to_string()),
        (module_release_label("version"), release.version.clone()),
        (component_label("name"), component.to_string()),
    ])
}

/// Inventory_labels is the discovery label set on the inventory object.
pub fn inventory_labels(release: &ReleaseMetadata) -> BTreeMap<String, String> {
    BTreeMap::from([
        (release_label("name"), release.name.clone()),
        (release_label("id"), release.identity.to_string()),
        (k8s_label("managed-by"), INVENTORY_MANAGED_BY.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_contract() {
        let rel = ReleaseMetadata {
            name: "my-blog".into(),
            namespace: "production".into(),
            module_fqn: "example.com/blog@v0#Blog".into(),
            version: "0.1.0".into(),
            identity: meta::release_id("example.com/blog@v0#Blog", "my-blog", "production"),
            labels: BTreeMap::new(),
        };
        let labels = tracking_labels(&rel, "web");
        assert_eq!(labels["app.kubernetes.io/managed-by"], MANAGED_BY);
        assert_eq!(labels["app.kubernetes.io/instance"], "my-blog-production");
        assert_eq!(labels["component.opmodel.dev/name"], "web");
        assert_eq!(labels["release.opmodel.dev/name"], "my-blog");
        assert_eq!(
            labels["release.opmodel.dev/id"],
            rel.identity.to_string()
        );
    }
}

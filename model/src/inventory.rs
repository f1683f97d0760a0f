//! Inventory entries, payload, and the apply digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::resource::Resource;

/// One resource owned by a release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InventoryEntry {
    /// API group; empty for the core group.
    pub group: String,
    /// Kind.
    pub kind: String,
    /// Namespace; empty for cluster-scoped resources.
    pub namespace: String,
    /// Resource name.
    pub name: String,
    /// API version at the time of apply. Excluded from identity so entries
    /// survive API-version migrations.
    pub version: String,
    /// Component that produced the resource.
    pub component: String,
}

impl InventoryEntry {
    /// From_resource records a rendered resource.
    pub fn from_resource(r: &Resource) -> InventoryEntry {
        InventoryEntry {
            group: r.gvk.group.clone(),
            kind: r.gvk.kind.clone(),
            namespace: r.namespace().to_string(),
            name: r.name().to_string(),
            version: r.gvk.version.clone(),
            component: r.component.clone(),
        }
    }

    /// Same_entry is identity equality: version is ignored.
    pub fn same_entry(&self, other: &InventoryEntry) -> bool {
        self.same_k8s_object(other) && self.component == other.component
    }

    /// Same_k8s_object compares the Kubernetes identity only: version and
    /// component are ignored. Used to tell a component rename apart from an
    /// orphan-plus-new pair.
    pub fn same_k8s_object(&self, other: &InventoryEntry) -> bool {
        self.group == other.group
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }

    fn sort_key(&self) -> (&str, &str, &str, &str, &str) {
        (
            &self.group,
            &self.kind,
            &self.namespace,
            &self.name,
            &self.component,
        )
    }
}

/// Sort_entries orders entries by (group, kind, namespace, name,
/// component), the canonical order the digest is computed over.
pub fn sort_entries(entries: &mut [InventoryEntry]) {
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Digest computes the apply digest: SHA-256 over the canonical JSON of the
/// sorted entry list. Same inputs, same digest.
pub fn digest(entries: &[InventoryEntry]) -> String {
    let mut sorted = entries.to_vec();
    sort_entries(&mut sorted);
    let canonical = serde_json::to_vec(&sorted).expect("entries serialize");
    let mut h = Sha256::new();
    h.update(&canonical);
    format!("{:x}", h.finalize())
}

/// Reference to the owning release inside the payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReleaseRef {
    /// Release name.
    pub name: String,
    /// Release namespace.
    pub namespace: String,
    /// Release identity.
    pub identity: Uuid,
    /// FQN of the source module.
    #[serde(rename = "moduleFQN")]
    pub module_fqn: String,
    /// Module version at apply time.
    pub version: String,
}

/// The serialized inventory payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InventoryPayload {
    /// Owning release.
    pub release: ReleaseRef,
    /// Owned resources.
    pub entries: Vec<InventoryEntry>,
    /// Apply digest over the sorted entries.
    pub digest: String,
}

impl InventoryPayload {
    /// New builds a payload, sorting entries and computing the digest.
    pub fn new(release: ReleaseRef, mut entries: Vec<InventoryEntry>) -> InventoryPayload {
        sort_entries(&mut entries);
        let digest = digest(&entries);
        InventoryPayload {
            release,
            entries,
            digest,
        }
    }

    /// Stale reports entries of `self` that are not among `current` (by
    /// entry identity). These are removed from the cluster on the next
    /// apply.
    pub fn stale(&self, current: &[InventoryEntry]) -> Vec<InventoryEntry> {
        self.entries
            .iter()
            .filter(|prev| !current.iter().any(|c| c.same_entry(prev)))
            .cloned()
            .collect()
    }

    /// Renames pairs stale entries with current entries that share the same
    /// Kubernetes identity but a different component: `(old, new)`.
    pub fn renames<'a>(
        &'a self,
        current: &'a [InventoryEntry],
    ) -> Vec<(&'a InventoryEntry, &'a InventoryEntry)> {
        self.stale_refs(current)
            .into_iter()
            .filter_map(|old| {
                current
                    .iter()
                    .find(|c| c.same_k8s_object(old) && c.component != old.component)
                    .map(|new| (old, new))
            })
            .collect()
    }

    fn stale_refs<'a>(&'a self, current: &[InventoryEntry]) -> Vec<&'a InventoryEntry> {
        self.entries
            .iter()
            .filter(|prev| !current.iter().any(|c| c.same_entry(prev)))
            .collect()
    }
}

/// Inventory_name is the canonical name of the inventory object for a
/// release. Name alone may collide across namespaces; the identity label is
/// also indexed for discovery.
pub fn inventory_name(release_name: &str, identity: &Uuid) -> String {
    format!("opm.{release_name}.{identity}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, name: &str, component: &str, version: &str) -> InventoryEntry {
        InventoryEntry {
            group: if kind == "Deployment" { "apps" } else { "" }.to_string(),
            kind: kind.to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            version: version.to_string(),
            component: component.to_string(),
        }
    }

    #[test]
    fn digest_is_order_independent() {
        let a = vec![
            entry("Deployment", "blog-web", "web", "v1"),
            entry("Service", "blog-web", "web", "v1"),
        ];
        let b: Vec<_> = a.iter().rev().cloned().collect();
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn digest_changes_with_entries() {
        let a = vec![entry("Deployment", "blog-web", "web", "v1")];
        let b = vec![entry("Deployment", "blog-api", "api", "v1")];
        assert_ne!(digest(&a), digest(&b));
    }

    #[test]
    fn entry_identity_ignores_version() {
        let old = entry("Deployment", "blog-web", "web", "v1");
        let migrated = entry("Deployment", "blog-web", "web", "v1beta1");
        assert!(old.same_entry(&migrated));
        assert!(old.same_k8s_object(&migrated));
    }

    #[test]
    fn k8s_identity_ignores_component() {
        let old = entry("Deployment", "blog-frontend", "web", "v1");
        let renamed = entry("Deployment", "blog-frontend", "frontend", "v1");
        assert!(!old.same_entry(&renamed));
        assert!(old.same_k8s_object(&renamed));
    }

    #[test]
    fn rename_detection() {
        let prior = InventoryPayload::new(
            ReleaseRef {
                name: "blog".into(),
                namespace: "default".into(),
                identity: crate::meta::release_id("example.com/blog@v0#Blog", "blog", "default"),
                module_fqn: "example.com/blog@v0#Blog".into(),
                version: "0.1.0".into(),
            },
            vec![entry("Deployment", "blog-frontend", "web", "v1")],
        );
        let current = vec![entry("Deployment", "blog-frontend", "frontend", "v1")];
        let renames = prior.renames(&current);
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].0.component, "web");
        assert_eq!(renames[0].1.component, "frontend");
        // The stale set still contains the old entry; apply removes it
        // only when the Kubernetes identity actually changed.
        assert_eq!(prior.stale(&current).len(), 1);
    }
}

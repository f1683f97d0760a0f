//! Diff: three-way semantic comparison of rendered, live, and inventoried
//! state.
//!
//! The comparison is a projection: only fields the render sets are
//! compared, so server-managed and default-populated fields never show up
//! as drift. Orphans come from the prior inventory.

use similar::TextDiff;

use model::resource::apply_weight;

use crate::prelude::*;

/// Comparison state of one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffState {
    /// Not on the cluster; apply would create it.
    Added,
    /// On the cluster but semantically different; carries a rendered diff.
    Modified(String),
    /// On the cluster and equal.
    Unchanged,
    /// In the prior inventory but no longer rendered; removed on the next
    /// apply.
    Orphaned,
    /// The live state could not be read.
    Unknown(String),
}

impl DiffState {
    /// Word renders the one-word state column.
    pub fn word(&self) -> &'static str {
        match self {
            DiffState::Added => "Added",
            DiffState::Modified(_) => "Modified",
            DiffState::Unchanged => "Unchanged",
            DiffState::Orphaned => "Orphaned",
            DiffState::Unknown(_) => "Unknown",
        }
    }
}

/// One line of the diff report.
#[derive(Clone, Debug)]
pub struct DiffEntry {
    /// Group/version/kind.
    pub gvk: Gvk,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Producing component (empty for orphans of unknown provenance).
    pub component: String,
    /// Comparison state.
    pub state: DiffState,
}

/// Diff compares rendered resources against the cluster and the prior
/// inventory. `resources` must already carry tracking labels and be
/// weight-sorted; the report keeps that order, orphans last.
#[instrument(skip_all)]
pub async fn diff<C: ClusterClient>(
    client: &C,
    resources: &[Resource],
    prior: Option<&InventoryPayload>,
) -> Result<Vec<DiffEntry>> {
    let mut report = Vec::with_capacity(resources.len());
    for r in resources {
        let state = match client.get(&r.gvk, r.namespace(), r.name()).await {
            Ok(None) => DiffState::Added,
            Ok(Some(live)) => match semantic_diff(&r.object, &live) {
                None => DiffState::Unchanged,
                Some(text) => DiffState::Modified(text),
            },
            // Per-resource read failures degrade to Unknown; the rest of
            // the report is still produced.
            Err(e) => DiffState::Unknown(e.to_string()),
        };
        trace!(gvk = %r.gvk, name = r.name(), state = state.word(), "compared");
        report.push(DiffEntry {
            gvk: r.gvk.clone(),
            namespace: r.namespace().to_string(),
            name: r.name().to_string(),
            component: r.component.clone(),
            state,
        });
    }

    if let Some(prior) = prior {
        let rendered: Vec<InventoryEntry> =
            resources.iter().map(InventoryEntry::from_resource).collect();
        let mut orphans: Vec<InventoryEntry> = prior
            .entries
            .iter()
            .filter(|e| !rendered.iter().any(|r| r.same_k8s_object(e)))
            .cloned()
            .collect();
        orphans.sort_by(|a, b| {
            let ga = Gvk {
                group: a.group.clone(),
                version: a.version.clone(),
                kind: a.kind.clone(),
            };
            let gb = Gvk {
                group: b.group.clone(),
                version: b.version.clone(),
                kind: b.kind.clone(),
            };
            apply_weight(&ga)
                .cmp(&apply_weight(&gb))
                .then_with(|| ga.cmp(&gb))
                .then_with(|| a.namespace.cmp(&b.namespace))
                .then_with(|| a.name.cmp(&b.name))
        });
        for e in orphans {
            let gvk = Gvk {
                group: e.group.clone(),
                version: e.version.clone(),
                kind: e.kind.clone(),
            };
            let state = match client.get(&gvk, &e.namespace, &e.name).await {
                Ok(Some(_)) => DiffState::Orphaned,
                // Already gone; nothing to report.
                Ok(None) => continue,
                Err(err) => DiffState::Unknown(err.to_string()),
            };
            report.push(DiffEntry {
                gvk,
                namespace: e.namespace.clone(),
                name: e.name.clone(),
                component: e.component.clone(),
                state,
            });
        }
    }
    debug!(entries = report.len(), "diff report built");
    Ok(report)
}

/// Semantic_diff compares the rendered object against the live one,
/// ignoring everything the render does not set plus the server-managed
/// metadata fields. `None` means semantically equal; otherwise a unified
/// diff of the two projections is returned.
pub fn semantic_diff(local: &serde_json::Value, live: &serde_json::Value) -> Option<String> {
    let local = scrub(local.clone());
    let projected = project(&scrub(live.clone()), &local);
    if projected == local {
        return None;
    }
    let live_yaml = serde_yaml::to_string(&projected).unwrap_or_default();
    let local_yaml = serde_yaml::to_string(&local).unwrap_or_default();
    let text = TextDiff::from_lines(&live_yaml, &local_yaml)
        .unified_diff()
        .context_radius(3)
        .header("live", "rendered")
        .to_string();
    Some(text)
}

/// Server-managed fields never participate in the comparison.
const SCRUBBED_METADATA: &[&str] = &[
    "creationTimestamp",
    "generation",
    "managedFields",
    "resourceVersion",
    "uid",
];

fn scrub(mut obj: serde_json::Value) -> serde_json::Value {
    if let Some(map) = obj.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for key in SCRUBBED_METADATA {
                meta.remove(*key);
            }
        }
    }
    obj
}

/// Project keeps only the parts of `live` that `local` also sets. Objects
/// recurse; everything else is taken whole.
fn project(live: &serde_json::Value, local: &serde_json::Value) -> serde_json::Value {
    match (live, local) {
        (serde_json::Value::Object(live), serde_json::Value::Object(local)) => {
            let mut out = serde_json::Map::new();
            for (k, lv) in local {
                match live.get(k) {
                    Some(rv) => {
                        out.insert(k.clone(), project(rv, lv));
                    }
                    None => {
                        // Missing on the cluster: keep the local shape so
                        // the difference shows.
                    }
                }
            }
            serde_json::Value::Object(out)
        }
        _ => live.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rendered() -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "blog-web", "namespace": "blog"},
            "spec": {"replicas": 2},
        })
    }

    #[test]
    fn server_fields_do_not_count_as_drift() {
        let live = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "blog-web",
                "namespace": "blog",
                "uid": "1234",
                "resourceVersion": "99",
                "creationTimestamp": "2026-01-01T00:00:00Z",
            },
            "spec": {"replicas": 2, "progressDeadlineSeconds": 600},
            "status": {"readyReplicas": 2},
        });
        assert!(semantic_diff(&rendered(), &live).is_none());
    }

    #[test]
    fn real_drift_is_reported_with_a_diff() {
        let live = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "blog-web", "namespace": "blog"},
            "spec": {"replicas": 5},
        });
        let text = semantic_diff(&rendered(), &live).expect("drift");
        assert!(text.contains("replicas"), "got: {text}");
    }

    #[test]
    fn missing_local_field_shows_in_projection() {
        let live = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "blog-web", "namespace": "blog"},
            "spec": {},
        });
        assert!(semantic_diff(&rendered(), &live).is_some());
    }
}

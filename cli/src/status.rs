//! Release status: inventory-driven health evaluation.
//!
//! Status never needs the module source; the inventory records what to
//! look at and the health rules are per-category.

use uuid::Uuid;

use crate::prelude::*;

/// Health of a single resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    /// The resource is ready.
    Ready,
    /// The resource finished successfully (Jobs).
    Complete,
    /// The resource is not ready; the reason is user-visible.
    NotReady(String),
}

impl Health {
    /// Ok reports whether the health counts toward an aggregate Ready.
    pub fn ok(&self) -> bool {
        matches!(self, Health::Ready | Health::Complete)
    }

    /// Word renders the one-word status column.
    pub fn word(&self) -> &str {
        match self {
            Health::Ready => "Ready",
            Health::Complete => "Complete",
            Health::NotReady(_) => "NotReady",
        }
    }
}

/// Per-pod diagnostics for the verbose drill-down.
#[derive(Clone, Debug)]
pub struct PodDiag {
    /// Pod name.
    pub name: String,
    /// Pod phase.
    pub phase: String,
    /// Whether every container is ready.
    pub ready: bool,
    /// First waiting or terminated reason, if any.
    pub reason: Option<String>,
    /// Total restart count.
    pub restarts: i64,
}

/// Status of one inventoried resource.
#[derive(Clone, Debug)]
pub struct ResourceReport {
    /// The inventory entry.
    pub entry: InventoryEntry,
    /// Evaluated health.
    pub health: Health,
    /// Pod diagnostics (verbose mode, workloads only).
    pub pods: Vec<PodDiag>,
}

/// The full status report for a release.
pub struct StatusReport {
    /// The owning release.
    pub release: ReleaseRef,
    /// Per-resource reports, in inventory order.
    pub resources: Vec<ResourceReport>,
    /// Whether every resource is Ready or Complete.
    pub ready: bool,
}

/// Options for the status operation.
#[derive(Debug, Default)]
pub struct StatusOptions {
    /// Pod drill-down for NotReady workloads.
    pub verbose: bool,
}

/// Status loads the inventory and evaluates every resource.
#[instrument(skip(client))]
pub async fn status<C: ClusterClient>(
    client: &C,
    release_name: Option<&str>,
    release_id: Option<&Uuid>,
    namespace: &str,
    opts: &StatusOptions,
) -> Result<StatusReport> {
    let store = InventoryStore::new(client);
    let inv = resolve_inventory(&store, release_name, release_id, namespace).await?;

    let (live, missing) = store.discover_resources(&inv).await?;
    let mut resources = Vec::with_capacity(inv.entries.len());
    for (entry, obj) in live {
        let health = evaluate(&obj);
        let mut pods = Vec::new();
        if opts.verbose && !health.ok() && is_workload(&entry.kind) {
            pods = pod_diagnostics(client, &entry, &obj).await;
        }
        resources.push(ResourceReport { entry, health, pods });
    }
    for entry in missing {
        resources.push(ResourceReport {
            entry,
            health: Health::NotReady("not found".into()),
            pods: Vec::new(),
        });
    }
    let ready = resources.iter().all(|r| r.health.ok());
    debug!(
        release = inv.release.name,
        resources = resources.len(),
        ready,
        "evaluated status"
    );
    Ok(StatusReport {
        release: inv.release.clone(),
        resources,
        ready,
    })
}

/// Resolve_inventory finds the release's inventory or reports
/// [`Error::ReleaseNotFound`].
pub async fn resolve_inventory<C: ClusterClient>(
    store: &InventoryStore<'_, C>,
    release_name: Option<&str>,
    release_id: Option<&Uuid>,
    namespace: &str,
) -> Result<InventoryPayload> {
    let inv = match (release_name, release_id) {
        (Some(name), id) => store.get(name, namespace, id).await?,
        (None, Some(id)) => store.find_by_release_id(id, namespace).await?,
        (None, None) => None,
    };
    inv.ok_or_else(|| {
        Error::ReleaseNotFound(match (release_name, release_id) {
            (Some(n), _) => format!("{n} in {namespace}"),
            (None, Some(id)) => format!("{id} in {namespace}"),
            (None, None) => "no release name or id given".to_string(),
        })
    })
}

fn is_workload(kind: &str) -> bool {
    matches!(kind, "Deployment" | "StatefulSet" | "DaemonSet")
}

/// Evaluate applies the per-category health rules to a live object.
pub fn evaluate(obj: &serde_json::Value) -> Health {
    let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    let int_at = |ptr: &str| obj.pointer(ptr).and_then(|v| v.as_i64());
    match kind {
        "Deployment" | "StatefulSet" => {
            let want = int_at("/spec/replicas").unwrap_or(1);
            let ready = int_at("/status/readyReplicas").unwrap_or(0);
            if ready == want {
                Health::Ready
            } else {
                Health::NotReady(format!("{ready}/{want} replicas ready"))
            }
        }
        "DaemonSet" => {
            let want = int_at("/status/desiredNumberScheduled").unwrap_or(0);
            let ready = int_at("/status/numberReady").unwrap_or(0);
            if ready == want {
                Health::Ready
            } else {
                Health::NotReady(format!("{ready}/{want} scheduled pods ready"))
            }
        }
        "Job" => {
            if condition_true(obj, "Complete") {
                Health::Complete
            } else if condition_true(obj, "Failed") {
                Health::NotReady("job failed".into())
            } else {
                Health::NotReady("job running".into())
            }
        }
        // Schedules are passive.
        "CronJob" => Health::Ready,
        "Service" | "ConfigMap" | "Secret" | "PersistentVolumeClaim" | "Namespace" => {
            Health::Ready
        }
        _ => {
            // Custom kinds: a Ready condition decides; without one the
            // object is treated as passive.
            match condition_status(obj, "Ready") {
                Some(true) => Health::Ready,
                Some(false) => Health::NotReady(
                    condition_message(obj, "Ready").unwrap_or_else(|| "Ready=False".into()),
                ),
                None => Health::Ready,
            }
        }
    }
}

fn conditions(obj: &serde_json::Value) -> Option<&Vec<serde_json::Value>> {
    obj.pointer("/status/conditions")?.as_array()
}

fn condition_status(obj: &serde_json::Value, type_: &str) -> Option<bool> {
    conditions(obj)?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
        .and_then(|c| c.get("status").and_then(|s| s.as_str()))
        .map(|s| s == "True")
}

fn condition_true(obj: &serde_json::Value, type_: &str) -> bool {
    condition_status(obj, type_) == Some(true)
}

fn condition_message(obj: &serde_json::Value, type_: &str) -> Option<String> {
    conditions(obj)?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
        .and_then(|c| c.get("message").and_then(|m| m.as_str()))
        .map(String::from)
}

/// Pod_diagnostics lists the pods behind a workload by its own label
/// selector. Failures here degrade to an empty list; status exits non-zero
/// for the health condition, not for diagnostic problems.
async fn pod_diagnostics<C: ClusterClient>(
    client: &C,
    entry: &InventoryEntry,
    obj: &serde_json::Value,
) -> Vec<PodDiag> {
    let Some(selector) = obj
        .pointer("/spec/selector/matchLabels")
        .and_then(|m| m.as_object())
    else {
        return Vec::new();
    };
    let selector = selector
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|v| format!("{k}={v}")))
        .collect::<Vec<_>>()
        .join(",");
    let pod_gvk = Gvk::from_api_version("v1", "Pod");
    let pods = match client.list(&pod_gvk, &entry.namespace, &selector).await {
        Ok(pods) => pods,
        Err(err) => {
            warn!(workload = entry.name, error = %err, "pod listing failed");
            return Vec::new();
        }
    };
    pods.iter().map(pod_diag).collect()
}

fn pod_diag(pod: &serde_json::Value) -> PodDiag {
    let name = pod
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let phase = pod
        .pointer("/status/phase")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown")
        .to_string();
    let statuses = pod
        .pointer("/status/containerStatuses")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let ready = !statuses.is_empty()
        && statuses
            .iter()
            .all(|c| c.get("ready").and_then(|r| r.as_bool()).unwrap_or(false));
    let reason = statuses.iter().find_map(|c| {
        let state = c.get("state")?;
        state
            .pointer("/waiting/reason")
            .or_else(|| state.pointer("/terminated/reason"))
            .and_then(|r| r.as_str())
            .map(String::from)
    });
    let restarts = statuses
        .iter()
        .filter_map(|c| c.get("restartCount").and_then(|r| r.as_i64()))
        .sum();
    PodDiag {
        name,
        phase,
        ready,
        reason,
        restarts,
    }
}

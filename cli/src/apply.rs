//! Apply: server-side apply in weight order, inventory update, stale
//! cleanup.
//!
//! The cluster offers no multi-resource transaction, so apply is designed
//! for partial failure: every resource is attempted, per-resource errors
//! are collected, and the summary always reflects what actually happened.

use tokio_util::sync::CancellationToken;

use model::inventory::{InventoryEntry, digest};
use model::resource::{apply_weight, sort_for_apply};
use model::tracking_labels;

use crate::prelude::*;
use crate::status::evaluate;

/// Options for apply.
#[derive(Debug)]
pub struct ApplyOptions {
    /// Plan only; no writes.
    pub dry_run: bool,
    /// Apply even when the inventory digest already matches.
    pub force_apply: bool,
    /// Poll for readiness after apply.
    pub wait: bool,
    /// Deadline for the readiness poll.
    pub timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            dry_run: false,
            force_apply: false,
            wait: false,
            timeout: crate::DEFAULT_TIMEOUT,
        }
    }
}

/// What happened to one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Created (not present in the prior inventory).
    Created,
    /// Updated in place.
    Configured,
    /// Dry run: would have been applied.
    Planned,
    /// The apply failed; the message is user-visible.
    Failed(String),
}

/// Per-resource apply record.
#[derive(Clone, Debug)]
pub struct ResourceOutcome {
    /// Group/version/kind.
    pub gvk: Gvk,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Producing component.
    pub component: String,
    /// What happened.
    pub action: Action,
}

/// The apply summary.
#[derive(Debug, Default)]
pub struct ApplySummary {
    /// Per-resource records, in apply order.
    pub outcomes: Vec<ResourceOutcome>,
    /// Created count.
    pub created: usize,
    /// Updated count.
    pub configured: usize,
    /// Per-resource errors (display name, message).
    pub errors: Vec<(String, String)>,
    /// The digest matched and nothing was done.
    pub short_circuited: bool,
    /// Stale entries removed.
    pub stale_deleted: usize,
    /// Component renames detected via Kubernetes identity: `(old, new)`.
    pub renames: Vec<(String, String)>,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
}

impl ApplySummary {
    /// Failed reports whether any per-resource error occurred.
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Apply reconciles rendered resources onto the cluster and updates the
/// release inventory.
#[instrument(skip_all, fields(release = release.name, namespace = release.namespace))]
pub async fn apply<C: ClusterClient>(
    client: &C,
    mut resources: Vec<Resource>,
    release: &ReleaseMetadata,
    opts: &ApplyOptions,
    cancel: &CancellationToken,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();

    for r in &mut resources {
        let component = r.component.clone();
        r.set_labels(&tracking_labels(release, &component));
    }
    sort_for_apply(&mut resources);

    let rendered: Vec<InventoryEntry> =
        resources.iter().map(InventoryEntry::from_resource).collect();
    let store = InventoryStore::new(client);
    let prior = store
        .get(&release.name, &release.namespace, Some(&release.identity))
        .await?;

    if let Some(prior) = &prior {
        for (old, new) in prior.renames(&rendered) {
            info!(
                from = old.component,
                to = new.component,
                resource = new.name,
                "component renamed"
            );
            summary
                .renames
                .push((old.component.clone(), new.component.clone()));
        }
        if !opts.force_apply && prior.digest == digest(&rendered) {
            debug!(digest = prior.digest, "inventory digest unchanged, skipping apply");
            summary.short_circuited = true;
            return Ok(summary);
        }
    }

    let prior_has = |e: &InventoryEntry| -> bool {
        prior
            .as_ref()
            .is_some_and(|p| p.entries.iter().any(|pe| pe.same_entry(e)))
    };

    let mut applied: Vec<InventoryEntry> = Vec::new();
    for (r, entry) in resources.iter().zip(rendered.iter()) {
        if cancel.is_cancelled() {
            summary
                .warnings
                .push("apply cancelled; partial results returned".into());
            break;
        }
        let resource_display = format!("{}/{}", r.gvk.kind, r.name());
        let mut outcome = ResourceOutcome {
            gvk: r.gvk.clone(),
            namespace: r.namespace().to_string(),
            name: r.name().to_string(),
            component: r.component.clone(),
            action: Action::Planned,
        };
        if opts.dry_run {
            summary.outcomes.push(outcome);
            continue;
        }
        match client.server_side_apply(r, false).await {
            Ok(_) => {
                if prior_has(entry) {
                    outcome.action = Action::Configured;
                    summary.configured = summary.configured.saturating_add(1);
                } else {
                    outcome.action = Action::Created;
                    summary.created = summary.created.saturating_add(1);
                }
                applied.push(entry.clone());
            }
            Err(ClusterError::Conflict(msg)) => {
                // Field-ownership conflict: take ownership and retry once.
                debug!(resource = resource_display, conflict = msg, "retrying apply with force");
                match client.server_side_apply(r, true).await {
                    Ok(_) => {
                        outcome.action = Action::Configured;
                        summary.configured = summary.configured.saturating_add(1);
                        applied.push(entry.clone());
                    }
                    Err(e) => {
                        outcome.action = Action::Failed(e.to_string());
                        summary.errors.push((resource_display, e.to_string()));
                    }
                }
            }
            Err(e) => {
                error!(resource = resource_display, error = %e, "apply failed");
                outcome.action = Action::Failed(e.to_string());
                summary.errors.push((resource_display, e.to_string()));
            }
        }
        summary.outcomes.push(outcome);
    }

    if opts.dry_run {
        return Ok(summary);
    }

    store.put(release, applied.clone()).await?;

    if let Some(prior) = &prior {
        // Stale entries are computed against the rendered set, not the
        // applied set, so a resource that failed to apply this round is
        // not torn down. Entries whose Kubernetes object was taken over by
        // a renamed component stay too: the object is still owned, only
        // the component label moved.
        let mut stale = prior.stale(&rendered);
        stale.retain(|e| !rendered.iter().any(|r| r.same_k8s_object(e)));
        if !stale.is_empty() {
            if summary.failed() {
                summary.warnings.push(format!(
                    "{} stale resource(s) left in place because apply had errors",
                    stale.len()
                ));
            } else {
                stale.sort_by_key(|e| {
                    std::cmp::Reverse(apply_weight(&Gvk {
                        group: e.group.clone(),
                        version: e.version.clone(),
                        kind: e.kind.clone(),
                    }))
                });
                for e in &stale {
                    let gvk = Gvk {
                        group: e.group.clone(),
                        version: e.version.clone(),
                        kind: e.kind.clone(),
                    };
                    match client.delete(&gvk, &e.namespace, &e.name).await {
                        Ok(_) => {
                            info!(kind = e.kind, name = e.name, "removed stale resource");
                            summary.stale_deleted = summary.stale_deleted.saturating_add(1);
                        }
                        Err(err) => summary
                            .warnings
                            .push(format!("stale {}/{}: {err}", e.kind, e.name)),
                    }
                }
            }
        }
    }

    if opts.wait && !summary.failed() {
        wait_ready(client, &applied, opts.timeout, cancel).await?;
    }

    Ok(summary)
}

/// Wait_ready polls every applied resource for readiness until the
/// deadline.
async fn wait_ready<C: ClusterClient>(
    client: &C,
    entries: &[InventoryEntry],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = tokio::time::Instant::now();
    let deadline = start.checked_add(timeout).unwrap_or(start);
    loop {
        let mut pending = Vec::new();
        for e in entries {
            let gvk = Gvk {
                group: e.group.clone(),
                version: e.version.clone(),
                kind: e.kind.clone(),
            };
            let healthy = match client.get(&gvk, &e.namespace, &e.name).await? {
                Some(obj) => evaluate(&obj).ok(),
                None => false,
            };
            if !healthy {
                pending.push(format!("{}/{}", e.kind, e.name));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::WaitTimeout(pending.join(", ")));
        }
        trace!(pending = pending.len(), "waiting for readiness");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = cancel.cancelled() => {
                return Err(Error::WaitTimeout(format!("cancelled; pending: {}", pending.join(", "))));
            }
        }
    }
}

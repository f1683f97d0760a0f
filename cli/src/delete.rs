//! Delete: reverse-weight, best-effort removal of a release.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use model::resource::apply_weight;

use crate::prelude::*;
use crate::status::resolve_inventory;

/// Options for delete.
#[derive(Debug, Default)]
pub struct DeleteOptions {
    /// Strip finalizers before deleting.
    pub force: bool,
    /// Plan only; no writes.
    pub dry_run: bool,
    /// A missing release is success instead of exit 5.
    pub ignore_not_found: bool,
}

/// Per-resource delete record.
#[derive(Clone, Debug)]
pub struct DeleteRecord {
    /// The inventory entry.
    pub entry: InventoryEntry,
    /// What happened, user-visible.
    pub outcome: String,
}

/// The delete summary.
#[derive(Debug, Default)]
pub struct DeleteSummary {
    /// Resources deleted.
    pub deleted: usize,
    /// Resources already gone.
    pub already_gone: usize,
    /// Per-resource records, in delete order.
    pub records: Vec<DeleteRecord>,
    /// Per-resource errors (display name, message).
    pub errors: Vec<(String, String)>,
    /// Whether the inventory object itself was removed.
    pub inventory_deleted: bool,
}

/// Delete removes every resource a release owns, then its inventory.
///
/// A release that was never applied is [`Error::ReleaseNotFound`] (exit 5)
/// unless `ignore_not_found` is set.
#[instrument(skip(client, cancel))]
pub async fn delete<C: ClusterClient>(
    client: &C,
    release_name: Option<&str>,
    release_id: Option<&Uuid>,
    namespace: &str,
    opts: &DeleteOptions,
    cancel: &CancellationToken,
) -> Result<DeleteSummary> {
    let store = InventoryStore::new(client);
    let inv = match resolve_inventory(&store, release_name, release_id, namespace).await {
        Ok(inv) => inv,
        Err(Error::ReleaseNotFound(what)) if opts.ignore_not_found => {
            info!(release = what, "release not found, nothing to delete");
            return Ok(DeleteSummary::default());
        }
        Err(e) => return Err(e),
    };

    let (live, missing) = store.discover_resources(&inv).await?;
    let mut summary = DeleteSummary {
        already_gone: missing.len(),
        ..Default::default()
    };
    for e in &missing {
        summary.records.push(DeleteRecord {
            entry: e.clone(),
            outcome: "already gone".into(),
        });
    }

    // Reverse apply order: dependents first.
    let mut live = live;
    live.sort_by_key(|(e, _)| {
        std::cmp::Reverse(apply_weight(&Gvk {
            group: e.group.clone(),
            version: e.version.clone(),
            kind: e.kind.clone(),
        }))
    });

    for (entry, obj) in &live {
        if cancel.is_cancelled() {
            summary
                .errors
                .push(("delete".into(), "cancelled before completion".into()));
            break;
        }
        let gvk = Gvk {
            group: entry.group.clone(),
            version: entry.version.clone(),
            kind: entry.kind.clone(),
        };
        let resource_display = format!("{}/{}", entry.kind, entry.name);
        if opts.dry_run {
            summary.records.push(DeleteRecord {
                entry: entry.clone(),
                outcome: "would delete".into(),
            });
            continue;
        }
        if opts.force && has_finalizers(obj) {
            debug!(resource = resource_display, "stripping finalizers");
            let patch = json!({"metadata": {"finalizers": null}});
            if let Err(e) = client
                .patch_merge(&gvk, &entry.namespace, &entry.name, &patch)
                .await
            {
                warn!(resource = resource_display, error = %e, "finalizer strip failed");
            }
        }
        match client.delete(&gvk, &entry.namespace, &entry.name).await {
            Ok(DeleteOutcome::Deleted) => {
                match finalizer_lockup(client, &gvk, entry).await {
                    Some(finalizers) => {
                        let msg = format!("blocked by finalizers: {}", finalizers.join(", "));
                        summary.errors.push((resource_display.clone(), msg.clone()));
                        summary.records.push(DeleteRecord {
                            entry: entry.clone(),
                            outcome: msg,
                        });
                    }
                    None => {
                        summary.deleted = summary.deleted.saturating_add(1);
                        summary.records.push(DeleteRecord {
                            entry: entry.clone(),
                            outcome: "deleted".into(),
                        });
                    }
                }
            }
            Ok(DeleteOutcome::NotFound) => {
                summary.already_gone = summary.already_gone.saturating_add(1);
                summary.records.push(DeleteRecord {
                    entry: entry.clone(),
                    outcome: "already gone".into(),
                });
            }
            Err(e) => {
                error!(resource = resource_display, error = %e, "delete failed");
                summary.errors.push((resource_display, e.to_string()));
            }
        }
    }

    if !opts.dry_run && summary.errors.is_empty() {
        store
            .delete(&inv.release.name, &inv.release.namespace, &inv.release.identity)
            .await?;
        summary.inventory_deleted = true;
    }
    info!(
        deleted = summary.deleted,
        already_gone = summary.already_gone,
        errors = summary.errors.len(),
        "delete finished"
    );
    Ok(summary)
}

fn has_finalizers(obj: &serde_json::Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(|f| f.as_array())
        .is_some_and(|f| !f.is_empty())
}

/// Finalizer_lockup re-reads a deleted resource; one stuck in terminating
/// with finalizers is surfaced with the finalizer list.
async fn finalizer_lockup<C: ClusterClient>(
    client: &C,
    gvk: &Gvk,
    entry: &InventoryEntry,
) -> Option<Vec<String>> {
    let obj = client
        .get(gvk, &entry.namespace, &entry.name)
        .await
        .ok()??;
    if obj.pointer("/metadata/deletionTimestamp").is_none() {
        return None;
    }
    let finalizers: Vec<String> = obj
        .pointer("/metadata/finalizers")?
        .as_array()?
        .iter()
        .filter_map(|f| f.as_str().map(String::from))
        .collect();
    if finalizers.is_empty() {
        None
    } else {
        Some(finalizers)
    }
}

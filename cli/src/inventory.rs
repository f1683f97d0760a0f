//! Inventory store.
//!
//! Per-release state lives in a Secret named
//! `opm.<releaseName>.<releaseIdentity>` carrying the serialized
//! [`InventoryPayload`] under one key. The name alone can collide across
//! namespaces, so the release identity is also label-indexed for
//! discovery.

use k8s_openapi::api::core::v1::Secret;
use uuid::Uuid;

use model::inventory::{InventoryEntry, InventoryPayload, inventory_name};
use model::{ReleaseMetadata, inventory_labels, release_label};

use crate::prelude::*;

/// PAYLOAD_KEY is the Secret key holding the serialized payload.
const PAYLOAD_KEY: &str = "inventory";

static SECRET_GVK: std::sync::LazyLock<Gvk> =
    std::sync::LazyLock::new(|| Gvk::from_api_version("v1", "Secret"));

/// InventoryStore is CRUD over the per-release inventory object.
pub struct InventoryStore<'c, C> {
    client: &'c C,
}

impl<'c, C: ClusterClient> InventoryStore<'c, C> {
    /// New wraps a cluster client.
    pub fn new(client: &'c C) -> InventoryStore<'c, C> {
        InventoryStore { client }
    }

    /// Get fetches the inventory for a release: direct GET by canonical
    /// name when the identity is known, label-selector fallback otherwise.
    /// `Ok(None)` when absent.
    pub async fn get(
        &self,
        release_name: &str,
        namespace: &str,
        release_id: Option<&Uuid>,
    ) -> Result<Option<InventoryPayload>> {
        if let Some(id) = release_id {
            let name = inventory_name(release_name, id);
            if let Some(obj) = self.client.get(&SECRET_GVK, namespace, &name).await? {
                return Ok(Some(decode_payload(release_name, &obj)?));
            }
            // Fall back to the identity label: the canonical name changes
            // if the release was renamed out from under us.
            let selector = format!("{}={id}", release_label("id"));
            let mut found = self.client.list(&SECRET_GVK, namespace, &selector).await?;
            return match found.pop() {
                Some(obj) => Ok(Some(decode_payload(release_name, &obj)?)),
                None => Ok(None),
            };
        }
        self.find_by_release_name(release_name, namespace).await
    }

    /// Find_by_release_id scans by the release-identity label. `Ok(None)`
    /// when absent.
    pub async fn find_by_release_id(
        &self,
        release_id: &Uuid,
        namespace: &str,
    ) -> Result<Option<InventoryPayload>> {
        let selector = format!("{}={release_id}", release_label("id"));
        let mut found = self.client.list(&SECRET_GVK, namespace, &selector).await?;
        match found.pop() {
            Some(obj) => Ok(Some(decode_payload(&release_id.to_string(), &obj)?)),
            None => Ok(None),
        }
    }

    /// Find_by_release_name scans by the release-name label. `Ok(None)`
    /// when absent.
    pub async fn find_by_release_name(
        &self,
        release_name: &str,
        namespace: &str,
    ) -> Result<Option<InventoryPayload>> {
        let selector = format!("{}={release_name}", release_label("name"));
        let mut found = self.client.list(&SECRET_GVK, namespace, &selector).await?;
        match found.pop() {
            Some(obj) => Ok(Some(decode_payload(release_name, &obj)?)),
            None => Ok(None),
        }
    }

    /// Put writes (or updates) the inventory, recomputing the digest. A
    /// field-ownership conflict is retried once with force: the store
    /// relies on resource-version optimistic concurrency, not locks.
    pub async fn put(
        &self,
        release: &ReleaseMetadata,
        entries: Vec<InventoryEntry>,
    ) -> Result<InventoryPayload> {
        let payload = InventoryPayload::new(
            ReleaseRef {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                identity: release.identity,
                module_fqn: release.module_fqn.clone(),
                version: release.version.clone(),
            },
            entries,
        );
        let resource = secret_for(release, &payload)?;
        match self.client.server_side_apply(&resource, false).await {
            Ok(_) => {}
            Err(ClusterError::Conflict(msg)) => {
                debug!(conflict = msg, "inventory write conflict, retrying with force");
                self.client.server_side_apply(&resource, true).await?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(
            release = release.name,
            entries = payload.entries.len(),
            digest = payload.digest,
            "inventory written"
        );
        Ok(payload)
    }

    /// Delete removes the inventory object. Not-found is success.
    pub async fn delete(
        &self,
        release_name: &str,
        namespace: &str,
        release_id: &Uuid,
    ) -> Result<()> {
        let name = inventory_name(release_name, release_id);
        match self.client.delete(&SECRET_GVK, namespace, &name).await? {
            DeleteOutcome::Deleted => info!(name, "inventory deleted"),
            DeleteOutcome::NotFound => debug!(name, "inventory already gone"),
        }
        Ok(())
    }

    /// Discover_resources fetches every inventoried resource. Returns the
    /// live objects (paired with their entries) and the entries whose
    /// resource is gone.
    pub async fn discover_resources(
        &self,
        inv: &InventoryPayload,
    ) -> Result<(Vec<(InventoryEntry, serde_json::Value)>, Vec<InventoryEntry>)> {
        let mut live = Vec::new();
        let mut missing = Vec::new();
        for entry in &inv.entries {
            let gvk = Gvk {
                group: entry.group.clone(),
                version: entry.version.clone(),
                kind: entry.kind.clone(),
            };
            match self
                .client
                .get(&gvk, &entry.namespace, &entry.name)
                .await?
            {
                Some(obj) => live.push((entry.clone(), obj)),
                None => missing.push(entry.clone()),
            }
        }
        Ok((live, missing))
    }
}

fn secret_for(release: &ReleaseMetadata, payload: &InventoryPayload) -> Result<Resource> {
    let buf = serde_json::to_string(payload)?;
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": inventory_name(&release.name, &release.identity),
            "namespace": release.namespace,
            "labels": inventory_labels(release),
        },
        "type": "opmodel.dev/inventory",
        "stringData": { PAYLOAD_KEY: buf },
    });
    Resource::from_object(secret, "", "")
        .ok_or_else(|| Error::Other(anyhow::anyhow!("inventory secret must have a GVK")))
}

/// Decode_payload reads the payload out of a Secret object, accepting both
/// `data` (base64, as returned by the API server) and `stringData`.
fn decode_payload(release: &str, obj: &serde_json::Value) -> Result<InventoryPayload> {
    let corrupt = |cause: String| Error::CorruptInventory {
        release: release.to_string(),
        cause,
    };
    let secret: Secret =
        serde_json::from_value(obj.clone()).map_err(|e| corrupt(e.to_string()))?;
    let buf: Vec<u8> = if let Some(data) = secret.data.as_ref().and_then(|d| d.get(PAYLOAD_KEY)) {
        data.0.clone()
    } else if let Some(s) = secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(PAYLOAD_KEY))
    {
        s.clone().into_bytes()
    } else {
        return Err(corrupt(format!("missing key: {PAYLOAD_KEY}")));
    };
    serde_json::from_slice(&buf).map_err(|e| corrupt(e.to_string()))
}

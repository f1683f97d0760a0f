//! Cluster client capability.
//!
//! The reconcile operations are written against [`ClusterClient`], a small
//! polymorphic surface over the cluster: server-side apply with
//! field-manager ownership, get, list, delete, merge-patch, and a
//! connectivity probe. The kube-backed implementation works on dynamic
//! objects so the core carries no kind-specific knowledge beyond the
//! weight table.

use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use tracing::{debug, trace};

use model::{FIELD_MANAGER, Gvk, Resource};

/// Errors a cluster client reports, classified for exit codes.
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// The cluster is unreachable.
    #[error("cluster connectivity error: {0}")]
    Connectivity(String),
    /// The credentials are not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Optimistic-concurrency or field-ownership conflict.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other API error.
    #[error("cluster error: {0}")]
    Api(String),
}

/// Outcome of a delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The delete was accepted.
    Deleted,
    /// The object was already gone.
    NotFound,
}

/// ClusterClient is the capability the reconciler consumes.
pub trait ClusterClient: Sync {
    /// Server-side apply with a stable field manager. `force` takes field
    /// ownership on conflict.
    fn server_side_apply(
        &self,
        resource: &Resource,
        force: bool,
    ) -> impl Future<Output = Result<serde_json::Value, ClusterError>> + Send;

    /// Get one object; `Ok(None)` when absent.
    fn get(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, ClusterError>> + Send;

    /// List objects matching a label selector.
    fn list(
        &self,
        gvk: &Gvk,
        namespace: &str,
        label_selector: &str,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, ClusterError>> + Send;

    /// Delete one object; absent objects report [`DeleteOutcome::NotFound`].
    fn delete(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<DeleteOutcome, ClusterError>> + Send;

    /// Merge-patch one object (used to strip finalizers on `--force`).
    fn patch_merge(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Probe the API server.
    fn check_connectivity(&self) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

/// Kube-backed [`ClusterClient`].
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// New wraps a kube client.
    pub fn new(client: kube::Client) -> KubeCluster {
        KubeCluster { client }
    }

    /// Connect infers the kube configuration the standard way
    /// (kubeconfig, then in-cluster) and probes connectivity.
    pub async fn connect() -> Result<KubeCluster, ClusterError> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| ClusterError::Connectivity(e.to_string()))?;
        let client = kube::client::ClientBuilder::try_from(config)
            .map_err(|e| ClusterError::Connectivity(e.to_string()))?
            .build();
        let c = KubeCluster::new(client);
        c.check_connectivity().await?;
        Ok(c)
    }

    fn api(&self, gvk: &Gvk, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let ar = ApiResource::from_gvk(&gvk);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }
}

fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            401 | 403 => ClusterError::PermissionDenied(resp.message),
            404 => ClusterError::NotFound(resp.message),
            409 => ClusterError::Conflict(resp.message),
            _ => ClusterError::Api(resp.message),
        },
        kube::Error::Service(e) => ClusterError::Connectivity(e.to_string()),
        kube::Error::HyperError(e) => ClusterError::Connectivity(e.to_string()),
        other => ClusterError::Api(other.to_string()),
    }
}

fn from_dynamic(obj: &DynamicObject) -> Result<serde_json::Value, ClusterError> {
    serde_json::to_value(obj).map_err(|e| ClusterError::Api(e.to_string()))
}

impl ClusterClient for KubeCluster {
    async fn server_side_apply(
        &self,
        resource: &Resource,
        force: bool,
    ) -> Result<serde_json::Value, ClusterError> {
        let api = self.api(&resource.gvk, resource.namespace());
        let params = {
            let p = PatchParams::apply(FIELD_MANAGER);
            if force { p.force() } else { p }
        };
        trace!(gvk = %resource.gvk, name = resource.name(), force, "server-side apply");
        let obj = api
            .patch(resource.name(), &params, &Patch::Apply(&resource.object))
            .await
            .map_err(classify)?;
        from_dynamic(&obj)
    }

    async fn get(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, ClusterError> {
        let api = self.api(gvk, namespace);
        match api.get_opt(name).await.map_err(classify)? {
            Some(obj) => Ok(Some(from_dynamic(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        gvk: &Gvk,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<serde_json::Value>, ClusterError> {
        let api = self.api(gvk, namespace);
        let params = ListParams::default().labels(label_selector);
        let list = api.list(&params).await.map_err(classify)?;
        list.items.iter().map(from_dynamic).collect()
    }

    async fn delete(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        let api = self.api(gvk, namespace);
        debug!(%gvk, namespace, name, "deleting");
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) => match classify(err) {
                ClusterError::NotFound(_) => Ok(DeleteOutcome::NotFound),
                other => Err(other),
            },
        }
    }

    async fn patch_merge(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        let api = self.api(gvk, namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), ClusterError> {
        self.client
            .apiserver_version()
            .await
            .map_err(|e| ClusterError::Connectivity(e.to_string()))?;
        Ok(())
    }
}

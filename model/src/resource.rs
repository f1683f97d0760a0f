//! Rendered resources, apply weights, and deterministic ordering.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Group/version/kind of a resource.
#[derive(Clone, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Gvk {
    /// API group; empty for the core group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind.
    pub kind: String,
}

impl Gvk {
    /// From_api_version splits an `apiVersion` string and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Gvk {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Gvk {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    /// Api_version renders the `apiVersion` string.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// A concrete resource produced by a transformer, with provenance.
#[derive(Clone, Debug)]
pub struct Resource {
    /// The full object (apiVersion, kind, metadata, body).
    pub object: serde_json::Value,
    /// Group/version/kind, extracted at decode time.
    pub gvk: Gvk,
    /// Name of the component that produced the resource.
    pub component: String,
    /// FQN of the transformer that produced the resource.
    pub transformer: String,
}

impl Resource {
    /// From_object wraps a decoded object, extracting its GVK. Objects
    /// without `apiVersion`/`kind` are rejected by the caller.
    pub fn from_object(
        object: serde_json::Value,
        component: &str,
        transformer: &str,
    ) -> Option<Resource> {
        let api_version = object.get("apiVersion")?.as_str()?.to_string();
        let kind = object.get("kind")?.as_str()?.to_string();
        Some(Resource {
            gvk: Gvk::from_api_version(&api_version, &kind),
            object,
            component: component.to_string(),
            transformer: transformer.to_string(),
        })
    }

    /// Name reports `metadata.name`, or the empty string.
    pub fn name(&self) -> &str {
        self.object
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Namespace reports `metadata.namespace`, or the empty string for
    /// cluster-scoped objects.
    pub fn namespace(&self) -> &str {
        self.object
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Set_labels merges labels into `metadata.labels`, keeping existing
    /// keys that are not overridden.
    pub fn set_labels(&mut self, labels: &BTreeMap<String, String>) {
        let meta = self
            .object
            .as_object_mut()
            .and_then(|o| o.get_mut("metadata"))
            .and_then(|m| m.as_object_mut());
        if let Some(meta) = meta {
            let entry = meta
                .entry("labels")
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
            if let Some(map) = entry.as_object_mut() {
                for (k, v) in labels {
                    map.insert(k.clone(), serde_json::Value::String(v.clone()));
                }
            }
        }
    }
}

/// Apply_weight orders a kind into the apply sequence. Lower weights apply
/// first; delete order is the strict reverse. Unlisted kinds weigh 100.
pub fn apply_weight(gvk: &Gvk) -> i32 {
    match gvk.kind.as_str() {
        "CustomResourceDefinition" => -100,
        "Namespace" => 0,
        "ClusterRole" | "ServiceAccount" => 5,
        "ClusterRoleBinding" | "Role" | "RoleBinding" => 10,
        "Secret" | "ConfigMap" => 15,
        "PersistentVolume" | "PersistentVolumeClaim" | "StorageClass" => 20,
        "Service" => 50,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" => 100,
        "Job" | "CronJob" => 110,
        "Ingress" | "IngressClass" | "HTTPRoute" | "Gateway" => 150,
        "HorizontalPodAutoscaler" | "PodDisruptionBudget" => 200,
        "ValidatingWebhookConfiguration" | "MutatingWebhookConfiguration" => 500,
        _ => 100,
    }
}

/// Sort_for_apply orders resources by weight, then namespace, then name.
/// The sort is stable so equal keys keep their render order.
pub fn sort_for_apply(resources: &mut [Resource]) {
    resources.sort_by(|a, b| {
        apply_weight(&a.gvk)
            .cmp(&apply_weight(&b.gvk))
            .then_with(|| a.namespace().cmp(b.namespace()))
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Sort_for_delete is the strict reverse of [`sort_for_apply`].
pub fn sort_for_delete(resources: &mut [Resource]) {
    sort_for_apply(resources);
    resources.reverse();
}

//! In-memory cluster double for reconcile tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde_json::Value;

use cli::cluster::{ClusterClient, ClusterError, DeleteOutcome};
use model::{Gvk, Resource};

type Key = (String, String, String); // kind, namespace, name

/// FakeCluster stores objects in memory and can be told to fail specific
/// applies with permission errors.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<Key, Value>>,
    deny: Mutex<BTreeSet<String>>,
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    /// Deny makes every apply of an object with this name fail with a
    /// permission error.
    pub fn deny<S: ToString>(&self, name: S) {
        self.deny.lock().expect("lock").insert(name.to_string());
    }

    /// Insert seeds an object directly, bypassing apply bookkeeping.
    pub fn insert(&self, obj: Value) {
        let key = key_of(&obj);
        self.objects.lock().expect("lock").insert(key, obj);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("lock").len()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("lock")
            .keys()
            .map(|(kind, _, name)| format!("{kind}/{name}"))
            .collect()
    }

    pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.objects
            .lock()
            .expect("lock")
            .contains_key(&(kind.to_string(), namespace.to_string(), name.to_string()))
    }
}

fn key_of(obj: &Value) -> Key {
    (
        obj.get("kind").and_then(|k| k.as_str()).unwrap_or("").to_string(),
        obj.pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        obj.pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    )
}

fn matches_selector(obj: &Value, selector: &str) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels = obj.pointer("/metadata/labels").and_then(|l| l.as_object());
    selector.split(',').all(|pair| {
        let Some((k, v)) = pair.split_once('=') else {
            return false;
        };
        labels
            .and_then(|l| l.get(k))
            .and_then(|lv| lv.as_str())
            .is_some_and(|lv| lv == v)
    })
}

impl ClusterClient for FakeCluster {
    async fn server_side_apply(
        &self,
        resource: &Resource,
        _force: bool,
    ) -> Result<Value, ClusterError> {
        if self.deny.lock().expect("lock").contains(resource.name()) {
            return Err(ClusterError::PermissionDenied(format!(
                "applies to {} are denied",
                resource.name()
            )));
        }
        let obj = resource.object.clone();
        self.objects
            .lock()
            .expect("lock")
            .insert(key_of(&obj), obj.clone());
        Ok(obj)
    }

    async fn get(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        let key = (gvk.kind.clone(), namespace.to_string(), name.to_string());
        Ok(self.objects.lock().expect("lock").get(&key).cloned())
    }

    async fn list(
        &self,
        gvk: &Gvk,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, ClusterError> {
        Ok(self
            .objects
            .lock()
            .expect("lock")
            .iter()
            .filter(|((kind, ns, _), _)| kind == &gvk.kind && ns == namespace)
            .filter(|(_, obj)| matches_selector(obj, label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn delete(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        let key = (gvk.kind.clone(), namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().expect("lock");
        let Some(obj) = objects.get_mut(&key) else {
            return Ok(DeleteOutcome::NotFound);
        };
        // Real apiserver semantics: a finalizer-bearing object is marked
        // terminating and stays until its finalizers clear.
        let finalizers = obj
            .pointer("/metadata/finalizers")
            .and_then(|f| f.as_array())
            .is_some_and(|f| !f.is_empty());
        if finalizers {
            if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert(
                    "deletionTimestamp".to_string(),
                    Value::String("2026-08-01T00:00:00Z".to_string()),
                );
            }
        } else {
            objects.remove(&key);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn patch_merge(
        &self,
        gvk: &Gvk,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClusterError> {
        let key = (gvk.kind.clone(), namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().expect("lock");
        let Some(obj) = objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(format!("{}/{name}", gvk.kind)));
        };
        json_merge(obj, patch);
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}

fn json_merge(doc: &mut Value, patch: &Value) {
    match (doc, patch) {
        (Value::Object(doc), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    doc.remove(k);
                } else {
                    json_merge(doc.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}

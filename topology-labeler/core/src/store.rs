use crate::patch::MergePatch;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

/// Identifies an object of a given kind. Cluster-scoped objects have no
/// namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

/// A Kubernetes object type that may be read from and patched in a [`Store`].
pub trait Object:
    k8s_openapi::Resource
    + k8s_openapi::Metadata<Ty = ObjectMeta>
    + Clone
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: k8s_openapi::Resource
        + k8s_openapi::Metadata<Ty = ObjectMeta>
        + Clone
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to encode patch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// The object store the labeler reads nodes and pods from, and writes pods
/// to.
///
/// Implementations must be safe to share between concurrent admission
/// requests.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// Writes the difference between `base` and `object`. The write must be
    /// rejected with [`StoreError::Conflict`] if the stored object no longer
    /// matches `base`'s resource version.
    async fn patch<K: Object>(&self, object: &K, base: &K) -> Result<(), StoreError>;
}

/// An in-memory [`Store`] that tracks how it is called.
///
/// Every insert and successful patch bumps the stored object's resource
/// version.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<Mutex<Objects>>);

#[derive(Debug, Default)]
struct Objects {
    by_key: HashMap<(&'static str, ObjectKey), Value>,
    version: u64,
    gets: usize,
    patches: usize,
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn cluster(name: impl ToString) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn of<K: k8s_openapi::Metadata<Ty = ObjectMeta>>(obj: &K) -> Self {
        let meta = obj.metadata();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

// === impl MemoryStore ===

impl MemoryStore {
    /// Stores `obj`, replacing any prior version of it.
    pub fn insert<K: Object>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).expect("object must serialize");
        let mut objects = self.0.lock();
        let version = objects.next_version();
        value["metadata"]["resourceVersion"] = Value::String(version);
        objects.by_key.insert((K::KIND, ObjectKey::of(obj)), value);
    }

    /// Reads an object without counting it as a store call.
    pub fn fetch<K: Object>(&self, key: &ObjectKey) -> Option<K> {
        let objects = self.0.lock();
        let value = objects.by_key.get(&(K::KIND, key.clone()))?;
        Some(serde_json::from_value(value.clone()).expect("stored object must deserialize"))
    }

    pub fn gets(&self) -> usize {
        self.0.lock().gets
    }

    pub fn patches(&self) -> usize {
        self.0.lock().patches
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get<K: Object>(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let value = {
            let mut objects = self.0.lock();
            objects.gets += 1;
            objects.by_key.get(&(K::KIND, key.clone())).cloned()
        };
        let value = value.ok_or_else(|| StoreError::NotFound {
            kind: K::KIND,
            key: key.clone(),
        })?;
        serde_json::from_value(value).map_err(|e| StoreError::Transport(e.into()))
    }

    async fn patch<K: Object>(&self, object: &K, base: &K) -> Result<(), StoreError> {
        let key = ObjectKey::of(object);
        let patch = MergePatch::from_base(base, object)?;

        let mut objects = self.0.lock();
        objects.patches += 1;
        if patch.is_empty() {
            return Ok(());
        }
        let version = objects.next_version();
        let current = objects
            .by_key
            .get_mut(&(K::KIND, key.clone()))
            .ok_or(StoreError::NotFound {
                kind: K::KIND,
                key,
            })?;

        if let Some(expected) = patch.resource_version() {
            let actual = current
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str);
            if actual != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "resource version {} does not match {}",
                    expected,
                    actual.unwrap_or("<none>")
                )));
            }
        }

        patch.apply_to(current);
        current["metadata"]["resourceVersion"] = Value::String(version);
        Ok(())
    }
}

// === impl Objects ===

impl Objects {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Node, Pod};

    fn mk_pod(labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some("p1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_counts_calls() {
        let store = MemoryStore::default();
        store.insert(&mk_pod(&[]));

        let key = ObjectKey::namespaced("ns", "p1");
        let pod: Pod = store.get(&key).await.unwrap();
        assert_eq!(pod.metadata.resource_version.as_deref(), Some("1"));

        let missing: Result<Node, _> = store.get(&ObjectKey::cluster("p1")).await;
        assert!(matches!(missing, Err(StoreError::NotFound { kind: "Node", .. })));
        assert_eq!(store.gets(), 2);
        assert_eq!(store.patches(), 0);
    }

    #[tokio::test]
    async fn patch_bumps_version() {
        let store = MemoryStore::default();
        store.insert(&mk_pod(&[("app", "y")]));

        let key = ObjectKey::namespaced("ns", "p1");
        let base: Pod = store.get(&key).await.unwrap();
        let mut pod = base.clone();
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("zone".to_string(), "a".to_string());
        store.patch(&pod, &base).await.unwrap();

        let stored = store.fetch::<Pod>(&key).unwrap();
        assert_eq!(stored.metadata.labels, pod.metadata.labels);
        assert_ne!(stored.metadata.resource_version, base.metadata.resource_version);
    }

    #[tokio::test]
    async fn stale_patch_conflicts() {
        let store = MemoryStore::default();
        store.insert(&mk_pod(&[]));

        let key = ObjectKey::namespaced("ns", "p1");
        let base: Pod = store.get(&key).await.unwrap();

        // Another writer replaces the pod after our read.
        store.insert(&mk_pod(&[("app", "z")]));

        let mut pod = base.clone();
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("zone".to_string(), "a".to_string());
        let result = store.patch(&pod, &base).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let stored = store.fetch::<Pod>(&key).unwrap();
        assert_eq!(
            stored.metadata.labels.unwrap().get("app").map(String::as_str),
            Some("z")
        );
    }

    #[tokio::test]
    async fn empty_patch_is_not_written() {
        let store = MemoryStore::default();
        store.insert(&mk_pod(&[("app", "y")]));

        let key = ObjectKey::namespaced("ns", "p1");
        let base: Pod = store.get(&key).await.unwrap();
        store.patch(&base.clone(), &base).await.unwrap();

        let stored = store.fetch::<Pod>(&key).unwrap();
        assert_eq!(
            stored.metadata.resource_version,
            base.metadata.resource_version
        );
    }
}

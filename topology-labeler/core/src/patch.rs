use serde::Serialize;
use serde_json::{Map, Value};

/// A JSON merge patch that turns a base snapshot into a desired object.
///
/// When the base carries a `metadata.resourceVersion`, it is sent along with
/// the changes so that the API server rejects the patch if the object has
/// been modified since the snapshot was taken.
#[derive(Clone, Debug, PartialEq)]
pub struct MergePatch {
    changes: Option<Value>,
    resource_version: Option<String>,
}

// === impl MergePatch ===

impl MergePatch {
    pub fn from_base<K: Serialize>(base: &K, desired: &K) -> Result<Self, serde_json::Error> {
        let base = serde_json::to_value(base)?;
        let desired = serde_json::to_value(desired)?;
        let resource_version = base
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Ok(Self {
            changes: diff(&base, &desired),
            resource_version,
        })
    }

    /// Returns true if the desired object is identical to its base. Empty
    /// patches are never sent.
    pub fn is_empty(&self) -> bool {
        self.changes.is_none()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Applies the changes to `target` following RFC 7386. The
    /// resource version precondition is not checked.
    pub fn apply_to(&self, target: &mut Value) {
        if let Some(changes) = self.changes.as_ref() {
            json_patch::merge(target, changes);
        }
    }

    pub fn into_value(self) -> Value {
        let mut patch = self.changes.unwrap_or_else(|| Value::Object(Map::new()));
        if let (Some(version), Value::Object(fields)) = (self.resource_version, &mut patch) {
            let metadata = fields
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(metadata) = metadata {
                metadata.insert("resourceVersion".to_string(), Value::String(version));
            }
        }
        patch
    }
}

fn diff(base: &Value, desired: &Value) -> Option<Value> {
    match (base, desired) {
        (Value::Object(base), Value::Object(desired)) => {
            let mut changes = Map::new();
            for (key, value) in desired {
                match base.get(key) {
                    Some(prior) => {
                        if let Some(change) = diff(prior, value) {
                            changes.insert(key.clone(), change);
                        }
                    }
                    None => {
                        changes.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in base.keys().filter(|k| !desired.contains_key(*k)) {
                changes.insert(key.clone(), Value::Null);
            }
            if changes.is_empty() {
                None
            } else {
                Some(Value::Object(changes))
            }
        }
        (base, desired) if base == desired => None,
        (_, desired) => Some(desired.clone()),
    }
}

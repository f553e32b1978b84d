use crate::{
    labels::TopologyLabels,
    request::{AdmissionRequest, Decision, Reason},
    store::{ObjectKey, Store, StoreError},
    DEFAULT_TOPOLOGY_PREFIX,
};
use k8s_openapi::api::core::v1::{Binding, Node, Pod};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Clone, Debug)]
pub struct Config {
    /// Logs raw bindings and every label written at info level.
    pub debug: bool,

    /// Node labels with keys under this prefix are copied onto pods.
    pub topology_prefix: String,
}

/// Copies node topology labels onto pods as they are bound to nodes.
#[derive(Clone, Debug)]
pub struct TopologyLabeler<S> {
    store: S,
    config: Arc<Config>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("admission request missing 'object'")]
    MissingObject,

    #[error("failed to decode binding: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to get node {name}: {source}")]
    GetNode { name: String, source: StoreError },

    #[error("failed to get pod {key}: {source}")]
    GetPod { key: ObjectKey, source: StoreError },

    #[error("failed to patch pod {key}: {source}")]
    Patch { key: ObjectKey, source: StoreError },
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            topology_prefix: DEFAULT_TOPOLOGY_PREFIX.to_string(),
        }
    }
}

// === impl Error ===

impl Error {
    /// The HTTP status code reported when denying a request.
    pub fn code(&self) -> u16 {
        match self {
            Self::Patch { .. } => 500,
            _ => 400,
        }
    }
}

// === impl TopologyLabeler ===

impl<S: Store> TopologyLabeler<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decides whether `req` may proceed.
    ///
    /// Only binding creations are considered; everything else is allowed
    /// without touching the store. A binding is allowed once its pod carries
    /// all of its node's topology labels, and denied if that cannot be
    /// ensured.
    pub async fn admit(&self, req: &AdmissionRequest) -> Decision {
        if !req.is_binding_create() {
            trace!(kind = %req.kind, operation = ?req.operation, "Skipped");
            return Decision::Allowed(Reason::Skipped);
        }

        match self.propagate(req).await {
            Ok(reason) => Decision::Allowed(reason),
            Err(error) => {
                info!(%error, name = %req.name, "Denied");
                Decision::deny(&error)
            }
        }
    }

    async fn propagate(&self, req: &AdmissionRequest) -> Result<Reason, Error> {
        if self.config.debug {
            if let Some(raw) = req.object.as_ref() {
                info!(namespace = ?req.namespace, name = %req.name, %raw, "Raw binding");
            }
        }

        let binding = decode_binding(req.object.as_ref())?;
        let pod_key = pod_key(req, &binding);
        let Some(node_name) = target_node(&binding) else {
            info!(pod = %pod_key, "Binding target is not a Node or has no name");
            return Ok(Reason::Skipped);
        };
        info!(pod = %pod_key, node = %node_name, "Binding pod to node");

        let node: Node = self
            .store
            .get(&ObjectKey::cluster(node_name))
            .await
            .map_err(|source| Error::GetNode {
                name: node_name.to_string(),
                source,
            })?;

        let mut pod: Pod = self
            .store
            .get(&pod_key)
            .await
            .map_err(|source| Error::GetPod {
                key: pod_key.clone(),
                source,
            })?;
        let base = pod.clone();

        let topology = TopologyLabels::from_node_labels(
            &self.config.topology_prefix,
            &node.metadata.labels.unwrap_or_default(),
        );
        let labels = pod.metadata.labels.get_or_insert_with(Default::default);
        if topology.is_satisfied_by(labels) {
            debug!(pod = %pod_key, "Pod labels already updated");
            return Ok(Reason::AlreadyLabeled);
        }

        for (key, value) in topology.iter() {
            if self.config.debug {
                info!(pod = %pod_key, %key, %value, "Updating label");
            } else {
                trace!(pod = %pod_key, %key, %value, "Updating label");
            }
        }
        topology.merge_into(labels);

        self.store
            .patch(&pod, &base)
            .await
            .map_err(|source| Error::Patch {
                key: pod_key.clone(),
                source,
            })?;
        info!(pod = %pod_key, labels = topology.len(), "Pod labels updated");
        Ok(Reason::Labeled)
    }
}

/// Decodes an admission request's object as a `Binding`.
pub fn decode_binding(object: Option<&Value>) -> Result<Binding, Error> {
    let object = object.ok_or(Error::MissingObject)?;
    Ok(Binding::deserialize(object)?)
}

/// Returns the name of the bound node, if the binding targets one.
fn target_node(binding: &Binding) -> Option<&str> {
    let target = &binding.target;
    if target.kind.as_deref() != Some("Node") {
        return None;
    }
    target.name.as_deref().filter(|name| !name.is_empty())
}

/// The bound pod is named by the binding's metadata, falling back to the
/// request's.
fn pod_key(req: &AdmissionRequest, binding: &Binding) -> ObjectKey {
    let meta = &binding.metadata;
    ObjectKey {
        namespace: meta
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| req.namespace.clone()),
        name: meta
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| req.name.clone()),
    }
}

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Propagates a node's topology labels onto the pods bound to it.
//!
//! The [`TopologyLabeler`] is driven by `Binding` admission requests. It
//! resolves the bound node and pod through a [`Store`], and patches the pod so
//! that it carries every topology label of its node.

mod labeler;
pub mod labels;
pub mod patch;
pub mod request;
pub mod store;


pub use self::{
    labeler::{decode_binding, Config, Error, TopologyLabeler},
    labels::TopologyLabels,
    patch::MergePatch,
    request::{AdmissionRequest, Decision, Operation, Reason},
    store::{MemoryStore, Object, ObjectKey, Store, StoreError},
};
pub use k8s_openapi::api::core::v1::{Binding, Node, Pod};

/// Label keys under this prefix are copied from nodes to pods by default.
pub const DEFAULT_TOPOLOGY_PREFIX: &str = "topology.kubernetes.io/";

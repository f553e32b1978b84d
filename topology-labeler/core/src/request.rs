use serde_json::Value;
use std::fmt;

pub const BINDING_KIND: &str = "Binding";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

/// A single admission request, as seen by the labeler.
///
/// The object is kept undecoded: only binding creations are ever decoded.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    pub kind: String,
    pub operation: Operation,
    pub namespace: Option<String>,
    pub name: String,
    pub object: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed(Reason),
    Denied { code: u16, message: String },
}

/// Why a request was allowed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    /// The request is not a pod-to-node binding.
    Skipped,
    /// The pod already carries its node's topology labels.
    AlreadyLabeled,
    /// The pod was patched with its node's topology labels.
    Labeled,
}

// === impl AdmissionRequest ===

impl AdmissionRequest {
    pub fn is_binding_create(&self) -> bool {
        self.kind == BINDING_KIND && self.operation == Operation::Create
    }
}

// === impl Decision ===

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub(crate) fn deny(error: &crate::Error) -> Self {
        Self::Denied {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

// === impl Reason ===

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::AlreadyLabeled => "already labeled",
            Self::Labeled => "labeled",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

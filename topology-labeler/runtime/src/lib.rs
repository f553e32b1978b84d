#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use topology_labeler_core as core;

mod admission;
mod args;
mod metrics;
mod store;

pub use self::{
    admission::Admission, args::Args, metrics::AdmissionMetrics, store::KubeStore,
};

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use k8s_injector_core as core;
pub use k8s_injector_k8s_api as k8s;
pub use k8s_injector_k8s_index as index;

mod admission;
mod args;
mod injection;
mod metrics;


pub use self::{
    admission::Admission,
    args::Args,
    injection::mutate,
    metrics::{AdmissionMetrics, Outcome},
};

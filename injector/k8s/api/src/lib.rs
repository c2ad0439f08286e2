#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod watch;

pub use self::{
    labels::{Labels, Selector},
    watch::{Event, Watch},
};
pub use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Resource,
};

/// The label that opts a namespace in, or a pod out, of injection.
pub const INJECTION_LABEL: &str = "k8s-injection";

/// The value of [`INJECTION_LABEL`] that opts a pod out of injection.
pub const INJECTION_DISABLED: &str = "disable";

/// Namespaces that are never mutated, regardless of their labels.
pub const SYSTEM_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

pub fn is_system_namespace(ns: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&ns)
}

//! Projects injection configs into JSON Patch operations.
//!
//! Each attribute of an [`InjectionConfig`] becomes zero or more `add` operations targeting the
//! config's patch path:
//!
//! - Unset attributes and empty lists produce nothing.
//! - When the path ends in `-` (JSON Patch's "end of array" token), each element of a list
//!   attribute is appended individually.
//! - Otherwise the whole attribute is added at the path, replacing whatever is there.

use crate::InjectionConfig;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// The JSON Patch token that refers to the end of an array.
const APPEND_MARKER: char = '-';

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PatchOperation {
    pub op: Op,
    pub path: String,
    pub value: Value,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Add,
}

/// An attribute of a config, serialized ahead of projection.
struct Attribute {
    name: &'static str,
    shape: Shape,
}

enum Shape {
    Unset,
    Single(serde_json::Result<Value>),
    List(Vec<serde_json::Result<Value>>),
}

// === impl PatchOperation ===

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: Op::Add,
            path: path.into(),
            value,
        }
    }
}

/// Returns true if `path` appends into an existing list rather than setting a value.
pub fn is_append(path: &str) -> bool {
    path.ends_with(APPEND_MARKER)
}

/// Builds the patch operations that apply `config` at `path`.
///
/// Attributes that fail to serialize are logged and skipped without affecting the rest of the
/// config.
pub fn project(path: &str, config: &InjectionConfig) -> Vec<PatchOperation> {
    let append = is_append(path);
    let mut ops = Vec::new();

    for Attribute { name, shape } in config.attributes() {
        match shape {
            Shape::Unset => {}

            Shape::Single(Ok(value)) => ops.push(PatchOperation::add(path, value)),

            Shape::List(items) => match items.into_iter().collect::<serde_json::Result<Vec<_>>>() {
                Ok(values) if append => {
                    ops.extend(values.into_iter().map(|v| PatchOperation::add(path, v)));
                }
                Ok(values) => ops.push(PatchOperation::add(path, Value::Array(values))),
                Err(error) => warn!(%error, %path, attribute = name, "Skipping attribute"),
            },

            Shape::Single(Err(error)) => {
                warn!(%error, %path, attribute = name, "Skipping attribute")
            }
        }
    }

    ops
}

// === impl InjectionConfig ===

impl InjectionConfig {
    /// Lists every patchable attribute in a fixed order.
    fn attributes(&self) -> [Attribute; 12] {
        // Destructured so that adding a field fails to compile until it is listed here.
        let Self {
            name: _,
            containers,
            volumes,
            env,
            volume_mounts,
            host_network,
            host_pid,
            init_containers,
            readiness_probe,
            liveness_probe,
            startup_probe,
            resources,
            ports,
        } = self;

        [
            Attribute::list("containers", containers),
            Attribute::list("volumes", volumes),
            Attribute::list("env", env),
            Attribute::list("volumeMounts", volume_mounts),
            Attribute::single("hostNetwork", host_network),
            Attribute::single("hostPID", host_pid),
            Attribute::list("initContainers", init_containers),
            Attribute::single("readinessProbe", readiness_probe),
            Attribute::single("livenessProbe", liveness_probe),
            Attribute::single("startupProbe", startup_probe),
            Attribute::single("resources", resources),
            Attribute::list("ports", ports),
        ]
    }
}

// === impl Attribute ===

impl Attribute {
    fn single<T: Serialize>(name: &'static str, value: &Option<T>) -> Self {
        let shape = match value {
            Some(v) => Shape::Single(serde_json::to_value(v)),
            None => Shape::Unset,
        };
        Self { name, shape }
    }

    fn list<T: Serialize>(name: &'static str, items: &[T]) -> Self {
        let shape = if items.is_empty() {
            Shape::Unset
        } else {
            Shape::List(items.iter().map(serde_json::to_value).collect())
        };
        Self { name, shape }
    }
}

use crate::{
    core::{ConfigSnapshot, PatchOperation},
    index::NamespaceIndex,
    k8s::{Pod, INJECTION_DISABLED, INJECTION_LABEL},
};
use anyhow::{Context, Result};
use kube::core::{admission::AdmissionRequest, DynamicObject};
use tracing::debug;

/// Decides which patch operations to apply to an admitted object.
///
/// Returns no operations when the object is not a pod, when the pod opts out of injection, or when
/// its namespace has not opted in. Fails only if the pod cannot be decoded.
pub fn mutate(
    req: &AdmissionRequest<DynamicObject>,
    configs: &ConfigSnapshot,
    namespaces: &NamespaceIndex,
) -> Result<Vec<PatchOperation>> {
    if !is_pod(req) {
        debug!(resource = ?req.resource, "Not a pod");
        return Ok(vec![]);
    }

    let obj = req.object.as_ref().context("admission request has no object")?;
    let pod: Pod = serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .context("failed to decode pod")?;

    let disabled = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(INJECTION_LABEL))
        .map(|v| v == INJECTION_DISABLED)
        .unwrap_or(false);
    if disabled {
        debug!("Injection disabled by pod label");
        return Ok(vec![]);
    }

    let ns = req
        .namespace
        .as_deref()
        .or(pod.metadata.namespace.as_deref())
        .unwrap_or_default();
    if !namespaces.is_enabled(ns) {
        debug!(%ns, "Injection not enabled in namespace");
        return Ok(vec![]);
    }

    Ok(configs.patches())
}

fn is_pod(req: &AdmissionRequest<DynamicObject>) -> bool {
    let gvr = &req.resource;
    gvr.group.is_empty() && gvr.version == "v1" && gvr.resource == "pods"
}

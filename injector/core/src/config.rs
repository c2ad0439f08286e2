use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Probe, ResourceRequirements, Volume, VolumeMount,
};
use serde::Deserialize;

/// A bundle of pod additions, applied at the patch path it is keyed by.
///
/// Every attribute is optional: an unset attribute (or an empty list) leaves the corresponding
/// part of the pod untouched.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionConfig {
    /// Describes the fragment in logs. Never patched into a pod.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub volumes: Vec<Volume>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default)]
    pub host_network: Option<bool>,

    #[serde(default, rename = "hostPID")]
    pub host_pid: Option<bool>,

    #[serde(default)]
    pub init_containers: Vec<Container>,

    #[serde(default)]
    pub readiness_probe: Option<Probe>,

    #[serde(default)]
    pub liveness_probe: Option<Probe>,

    #[serde(default)]
    pub startup_probe: Option<Probe>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

impl InjectionConfig {
    /// Parses a fragment from its YAML (or JSON) text.
    pub fn from_yaml(payload: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(payload)
    }
}

use crate::{patch, InjectionConfig, PatchOperation};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// An immutable set of injection configs, keyed by the patch path each applies to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigSnapshot {
    configs: BTreeMap<String, InjectionConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("none of the {0} injection configs could be loaded")]
    AllInvalid(usize),
}

#[derive(Debug, thiserror::Error)]
enum EntryError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("patch path {0:?} must start with '/'")]
    Path(String),
}

/// Derives a patch path from a config entry name, e.g. `.spec.containers.-` becomes
/// `/spec/containers/-`.
pub fn patch_path(entry: &str) -> String {
    entry.replace('.', "/")
}

// === impl ConfigSnapshot ===

impl ConfigSnapshot {
    /// Builds a snapshot from a config resource's entries.
    ///
    /// Entries that cannot be loaded are logged and left out. Fails only if there are entries and
    /// none of them can be loaded.
    pub fn build(data: &BTreeMap<String, String>) -> Result<Self, Error> {
        let mut configs = BTreeMap::new();
        for (entry, payload) in data {
            match load(entry, payload) {
                Ok((path, config)) => {
                    debug!(%entry, %path, "Loaded injection config");
                    configs.insert(path, config);
                }
                Err(error) => error!(%entry, %error, "Failed to load injection config"),
            }
        }

        if configs.is_empty() && !data.is_empty() {
            return Err(Error::AllInvalid(data.len()));
        }

        Ok(Self { configs })
    }

    pub fn get(&self, path: &str) -> Option<&InjectionConfig> {
        self.configs.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InjectionConfig)> {
        self.configs.iter().map(|(p, c)| (p.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Projects every config into patch operations, in patch path order.
    pub fn patches(&self) -> Vec<PatchOperation> {
        self.iter()
            .flat_map(|(path, config)| patch::project(path, config))
            .collect()
    }
}

impl std::iter::FromIterator<(String, InjectionConfig)> for ConfigSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, InjectionConfig)>>(iter: T) -> Self {
        Self {
            configs: iter.into_iter().collect(),
        }
    }
}

fn load(entry: &str, payload: &str) -> Result<(String, InjectionConfig), EntryError> {
    let path = patch_path(entry);
    if !path.starts_with('/') {
        return Err(EntryError::Path(path));
    }
    let config = InjectionConfig::from_yaml(payload)?;
    Ok((path, config))
}

use k8s_injector_core::ConfigSnapshot;
use k8s_injector_k8s_api::{ConfigMap, Event, ResourceExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Watches the current set of injection configs.
pub type ConfigRx = watch::Receiver<Arc<ConfigSnapshot>>;

/// Rebuilds the injection config snapshot as the config map changes, publishing each new
/// snapshot to readers.
#[derive(Debug)]
pub struct ConfigIndex {
    /// The name of the config map holding injection configs.
    name: String,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

// === impl ConfigIndex ===

impl ConfigIndex {
    pub fn new(name: impl Into<String>) -> (Self, ConfigRx) {
        let (tx, rx) = watch::channel(Arc::new(ConfigSnapshot::default()));
        let idx = Self {
            name: name.into(),
            tx,
        };
        (idx, rx)
    }

    pub fn handle(&mut self, event: Event<ConfigMap>) {
        match event {
            Event::Applied(cm) => self.apply(cm),
            Event::Deleted(cm) => self.delete(cm),
            Event::Restarted(cms) => self.reset(cms),
        }
    }

    pub fn apply(&mut self, cm: ConfigMap) {
        if cm.name_any() != self.name {
            debug!(name = %cm.name_any(), "Ignoring config map");
            return;
        }

        match ConfigSnapshot::build(&cm.data.unwrap_or_default()) {
            Ok(snapshot) => self.publish(snapshot),
            Err(error) => error!(%error, "Keeping previous injection configs"),
        }
    }

    pub fn delete(&mut self, cm: ConfigMap) {
        if cm.name_any() != self.name {
            return;
        }
        info!("Config map deleted");
        self.publish(ConfigSnapshot::default());
    }

    /// Rebuilds the snapshot from a complete listing.
    pub fn reset(&mut self, cms: Vec<ConfigMap>) {
        match cms.into_iter().find(|cm| cm.name_any() == self.name) {
            Some(cm) => self.apply(cm),
            None => {
                info!(name = %self.name, "Config map not found");
                self.publish(ConfigSnapshot::default());
            }
        }
    }

    fn publish(&self, snapshot: ConfigSnapshot) {
        let changed = self.tx.send_if_modified(|current| {
            if **current == snapshot {
                return false;
            }
            *current = Arc::new(snapshot);
            true
        });
        if changed {
            let snapshot = self.tx.borrow();
            let paths = snapshot.iter().map(|(p, _)| p).collect::<Vec<_>>();
            info!(?paths, "Updated injection configs");
        }
    }
}

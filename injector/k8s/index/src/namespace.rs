use ahash::AHashSet as HashSet;
use k8s_injector_k8s_api::{Event, Labels, Namespace, ResourceExt, Selector};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedNamespaceIndex = Arc<RwLock<NamespaceIndex>>;

/// Tracks the namespaces in which injection is enabled.
///
/// Namespaces are enabled by carrying every label in the index's selector. Any namespace the
/// index has not seen is treated as disabled.
#[derive(Debug)]
pub struct NamespaceIndex {
    selector: Selector,
    enabled: HashSet<String>,
}

// === impl NamespaceIndex ===

impl NamespaceIndex {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            enabled: HashSet::default(),
        }
    }

    pub fn shared(selector: Selector) -> SharedNamespaceIndex {
        Arc::new(RwLock::new(Self::new(selector)))
    }

    pub fn is_enabled(&self, ns: &str) -> bool {
        self.enabled.contains(ns)
    }

    pub fn len(&self) -> usize {
        self.enabled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn handle(&mut self, event: Event<Namespace>) {
        match event {
            Event::Applied(ns) => self.apply(ns),
            Event::Deleted(ns) => self.delete(ns),
            Event::Restarted(nss) => self.reset(nss),
        }
    }

    pub fn apply(&mut self, ns: Namespace) {
        let name = ns.name_any();
        if self.selects(&ns) {
            if self.enabled.insert(name.clone()) {
                info!(ns = %name, "Enabled injection");
            }
        } else if self.enabled.remove(&name) {
            info!(ns = %name, "Disabled injection");
        } else {
            debug!(ns = %name, "Ignoring namespace");
        }
    }

    pub fn delete(&mut self, ns: Namespace) {
        let name = ns.name_any();
        if self.enabled.remove(&name) {
            info!(ns = %name, "Disabled injection");
        }
    }

    /// Replaces the index with the namespaces in a complete listing.
    pub fn reset(&mut self, nss: Vec<Namespace>) {
        let enabled = nss
            .into_iter()
            .filter(|ns| self.selects(ns))
            .map(|ns| ns.name_any())
            .collect::<HashSet<_>>();

        for name in self.enabled.difference(&enabled) {
            info!(ns = %name, "Disabled injection");
        }
        for name in enabled.difference(&self.enabled) {
            info!(ns = %name, "Enabled injection");
        }
        self.enabled = enabled;
    }

    fn selects(&self, ns: &Namespace) -> bool {
        self.selector
            .matches(&Labels::from(ns.metadata.labels.clone()))
    }
}

//! Indexes the cluster state that drives injection decisions.
//!
//! Two indexes are maintained from watch events:
//!
//! - [`NamespaceIndex`] records which namespaces have opted in to injection.
//! - [`ConfigIndex`] rebuilds the [`ConfigSnapshot`](k8s_injector_core::ConfigSnapshot) from the
//!   injection config map and publishes it to readers.
//!
//! A single task, [`run`], owns both indexes' write side so that updates are applied in the
//! order they are received from each watch.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
pub mod metrics;
mod namespace;


pub use self::{
    config::{ConfigIndex, ConfigRx},
    namespace::{NamespaceIndex, SharedNamespaceIndex},
};
use k8s_injector_k8s_api::{ConfigMap, Event, Namespace};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Applies watch events to the indexes until shutdown is signaled or both watches are gone.
pub async fn run(
    namespaces: SharedNamespaceIndex,
    mut configs: ConfigIndex,
    mut ns_rx: mpsc::Receiver<Event<Namespace>>,
    mut cm_rx: mpsc::Receiver<Event<ConfigMap>>,
    shutdown: kubert::shutdown::Watch,
) {
    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);

    let (mut ns_open, mut cm_open) = (true, true);
    while ns_open || cm_open {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                debug!("Shutdown signaled");
                return;
            }

            event = ns_rx.recv(), if ns_open => match event {
                Some(event) => namespaces.write().handle(event),
                None => ns_open = false,
            },

            event = cm_rx.recv(), if cm_open => match event {
                Some(event) => configs.handle(event),
                None => cm_open = false,
            },
        }
    }

    info!("Watches closed");
}

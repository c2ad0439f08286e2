use crate::{
    admission::Admission,
    index::{self, ConfigIndex, NamespaceIndex},
    k8s::{self, watch, watcher, Api, ConfigMap, Event, Namespace, Selector},
    metrics::AdmissionMetrics,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::future;
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use std::fmt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, info_span, warn, Instrument};

/// Holds the namespace of the pod's service account, when running in a cluster.
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Parser)]
#[clap(name = "k8s-injector", about = "A mutating admission webhook that injects pod config")]
pub struct Args {
    #[clap(long, default_value = "k8s_injector=info,warn", env = "K8S_INJECTOR_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the config map holding injection configs.
    #[clap(long, env = "CONFIGMAP_NAME")]
    configmap_name: String,

    /// The namespace of the config map holding injection configs.
    ///
    /// Defaults to the namespace of the webhook's service account.
    #[clap(long, env = "CONFIGMAP_NAMESPACE")]
    configmap_namespace: Option<String>,

    /// Labels a namespace must carry for its pods to be injected, as `key=value` pairs separated
    /// by commas.
    #[clap(long, default_value = "k8s-injection=enabled", env = "WEBHOOK_ENABLE_LABEL")]
    webhook_enable_label: Selector,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            configmap_name,
            configmap_namespace,
            webhook_enable_label,
        } = self;

        let configmap_namespace = configmap_namespace.unwrap_or_else(default_namespace);

        let namespaces = NamespaceIndex::shared(webhook_enable_label.clone());
        let (configs, configs_rx) = ConfigIndex::new(configmap_name.clone());

        let mut prom = <Registry>::default();
        index::metrics::register(
            prom.sub_registry_with_prefix("index"),
            namespaces.clone(),
            configs_rx.clone(),
        );
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        // Spawn resource watches. Each feeds the indexer through a single-slot channel so that a
        // stalled indexer pauses the watch.

        let (ns_tx, ns_rx) = mpsc::channel(1);
        let ns_config = watcher::Config::default().labels(&webhook_enable_label.to_string());
        let ns_watch = tokio::spawn(
            watch_resources(
                Api::<Namespace>::all(runtime.client()),
                ns_config,
                ns_tx,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("namespaces")),
        );

        let (cm_tx, cm_rx) = mpsc::channel(1);
        info!(name = %configmap_name, ns = %configmap_namespace, "Watching injection configs");
        let cm_watch = tokio::spawn(
            watch_resources(
                Api::<ConfigMap>::namespaced(runtime.client(), &configmap_namespace),
                watcher::Config::default().fields(&format!("metadata.name={configmap_name}")),
                cm_tx,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("configmaps")),
        );

        tokio::spawn(
            index::run(
                namespaces.clone(),
                configs,
                ns_rx,
                cm_rx,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("index")),
        );

        let admission = Admission::new(namespaces, configs_rx, admission_metrics);
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal, unless a watch fails first. Once shutdown
        // is signaled, wait for the background tasks to complete before exiting.
        let run = runtime.run();
        let watches = future::try_join(join(ns_watch), join(cm_watch));
        tokio::pin!(run, watches);
        tokio::select! {
            res = &mut run => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = &mut watches => {
                res?;
                if run.await.is_err() {
                    bail!("Aborted");
                }
            }
        }

        Ok(())
    }
}

/// Watches a resource collection until shutdown or a fatal watch error.
async fn watch_resources<T>(
    api: Api<T>,
    config: watcher::Config,
    tx: mpsc::Sender<Event<T>>,
    shutdown: kubert::shutdown::Watch,
) -> Result<()>
where
    T: k8s::Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    T::DynamicType: Default,
{
    let connect = || watcher(api.clone(), config.clone());
    watch::run_restarting(connect, tx, shutdown)
        .await
        .map_err(|error| {
            warn!(%error, "Watch failed");
            error.into()
        })
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    task.await?
}

fn default_namespace() -> String {
    namespace_from_file(SERVICE_ACCOUNT_NAMESPACE)
}

fn namespace_from_file(path: impl AsRef<std::path::Path>) -> String {
    match std::fs::read_to_string(path) {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => "default".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "k8s-injector",
            "--configmap-name=injection-config",
            "--webhook-enable-label=k8s-injection=enabled,team=db",
        ])
        .expect("args must parse");
        assert_eq!(args.configmap_name, "injection-config");
        assert_eq!(args.configmap_namespace, None);
        assert_eq!(
            args.webhook_enable_label,
            Selector::from_iter([("k8s-injection", "enabled"), ("team", "db")])
        );
    }

    #[test]
    fn rejects_empty_enable_label() {
        for flag in ["--webhook-enable-label=", "--webhook-enable-label=,"] {
            let res =
                Args::try_parse_from(["k8s-injector", "--configmap-name=injection-config", flag]);
            assert!(res.is_err(), "{flag} must not parse");
        }
    }

    #[test]
    fn requires_configmap_name() {
        // Guard against the variable being set in the test environment.
        if std::env::var_os("CONFIGMAP_NAME").is_some() {
            return;
        }
        assert!(Args::try_parse_from(["k8s-injector"]).is_err());
    }

    #[test]
    fn namespace_defaults_without_service_account() {
        assert_eq!(namespace_from_file("/nonexistent/namespace"), "default");

        let path = std::env::temp_dir().join(format!("k8s-injector-ns-{}", std::process::id()));
        std::fs::write(&path, "k8s-injector\n").unwrap();
        assert_eq!(namespace_from_file(&path), "k8s-injector");
        std::fs::remove_file(&path).unwrap();
    }
}

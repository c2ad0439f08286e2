use crate::{ConfigRx, SharedNamespaceIndex};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented {
    namespaces: SharedNamespaceIndex,
    configs: ConfigRx,
}

pub fn register(reg: &mut Registry, namespaces: SharedNamespaceIndex, configs: ConfigRx) {
    reg.register_collector(Box::new(Instrumented {
        namespaces,
        configs,
    }));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let enabled = self.namespaces.read().len();
        let enabled_encoder = encoder.encode_descriptor(
            "enabled_namespaces",
            "The number of namespaces with injection enabled",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(enabled as u32).encode(enabled_encoder)?;

        let fragments = self.configs.borrow().len();
        let fragments_encoder = encoder.encode_descriptor(
            "config_fragments",
            "The number of injection configs in the current snapshot",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(fragments as u32).encode(fragments_encoder)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigIndex, NamespaceIndex};
    use k8s_injector_k8s_api::{Namespace, ObjectMeta, Selector};
    use maplit::btreemap;
    use std::iter::FromIterator;

    #[test]
    fn encodes_index_sizes() {
        let namespaces =
            NamespaceIndex::shared(Selector::from_iter(Some(("k8s-injection", "enabled"))));
        namespaces.write().apply(Namespace {
            metadata: ObjectMeta {
                name: Some("dbservice".to_string()),
                labels: Some(btreemap! {
                    "k8s-injection".to_string() => "enabled".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        let (_idx, configs) = ConfigIndex::new("injection-config");

        let mut reg = Registry::default();
        register(reg.sub_registry_with_prefix("index"), namespaces, configs);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &reg).unwrap();
        assert!(out.contains("index_enabled_namespaces 1"), "{out}");
        assert!(out.contains("index_config_fragments 0"), "{out}");
    }
}

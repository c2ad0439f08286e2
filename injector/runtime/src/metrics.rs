use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    requests: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

/// How an admission request was answered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Allowed with a patch.
    Patched,
    /// Allowed without a patch.
    Skipped,
    Denied,
    /// Allowed without consulting the indexes.
    Bypassed,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of admission requests answered, by outcome",
            requests.clone(),
        );
        Self { requests }
    }

    pub fn observe(&self, outcome: Outcome) {
        self.requests.get_or_create(&outcome.labels()).inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, outcome: Outcome) -> u64 {
        self.requests.get_or_create(&outcome.labels()).get()
    }
}

// === impl Outcome ===

impl Outcome {
    fn labels(self) -> OutcomeLabels {
        let outcome = match self {
            Self::Patched => "patched",
            Self::Skipped => "skipped",
            Self::Denied => "denied",
            Self::Bypassed => "bypassed",
        };
        OutcomeLabels { outcome }
    }
}

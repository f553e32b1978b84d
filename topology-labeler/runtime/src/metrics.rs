use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use topology_labeler_core::Decision;

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    decisions: Family<DecisionLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DecisionLabels {
    allowed: &'static str,
    reason: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Family::<DecisionLabels, Counter>::default();
        reg.register(
            "decisions",
            "Total number of admission requests handled, by outcome",
            decisions.clone(),
        );
        Self { decisions }
    }

    pub(crate) fn observe(&self, decision: &Decision) {
        let labels = match decision {
            Decision::Allowed(reason) => DecisionLabels {
                allowed: "true",
                reason: reason.as_str(),
            },
            Decision::Denied { code, .. } => DecisionLabels {
                allowed: "false",
                reason: if *code >= 500 {
                    "server error"
                } else {
                    "client error"
                },
            },
        };
        self.decisions.get_or_create(&labels).inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, allowed: &'static str, reason: &'static str) -> u64 {
        self.decisions
            .get_or_create(&DecisionLabels { allowed, reason })
            .get()
    }
}

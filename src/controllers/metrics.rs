//! Prometheus metrics for the two reconcile loops, grounded in the same
//! `prometheus::Registry`-backed shape the teacher's operator exposes
//! (reconcile counters + duration histograms keyed by resource kind).

use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconciliations = IntCounterVec::new(
            opts!("proxmox_capi_reconciliations_total", "reconciliations processed"),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("proxmox_capi_reconcile_failures_total", "reconcile failures"),
            &["kind", "error"],
        )
        .unwrap();
        let reconcile_duration = HistogramVec::new(
            histogram_opts!("proxmox_capi_reconcile_duration_seconds", "reconcile duration"),
            &["kind"],
        )
        .unwrap();
        Self {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        Ok(self)
    }

    pub fn count_and_measure(&self, kind: &str) -> prometheus::HistogramTimer {
        self.reconciliations.with_label_values(&[kind]).inc();
        self.reconcile_duration.with_label_values(&[kind]).start_timer()
    }

    pub fn reconcile_failure<K: ResourceExt>(&self, kind: &str, _resource: &K, error: &crate::errors::Error) {
        self.failures.with_label_values(&[kind, error_label(error)]).inc();
    }
}

fn error_label(error: &crate::errors::Error) -> &'static str {
    match error {
        crate::errors::Error::Kube(_) => "kube",
        crate::errors::Error::Finalizer(_) => "finalizer",
        crate::errors::Error::Proxmox(_) => "proxmox",
        crate::errors::Error::Waiting(_) => "waiting",
        crate::errors::Error::Transient(_) => "transient",
        crate::errors::Error::Terminal { .. } => "terminal",
        crate::errors::Error::InvalidSpec(_) => "invalid_spec",
    }
}

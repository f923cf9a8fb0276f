use anyhow::Result;
use prometheus::{IntCounter, IntGaugeVec, Opts, Registry};

/// Prometheus metrics for service health and observability.
///
/// All metrics use the "beamsync" namespace. Ingest counters are fed from
/// the coordinator's one-second status sampling (the per-queue counters
/// are zeroed there, so each sample is a delta); assembler totals are
/// mirrored into gauges; the serializer increments publish counters
/// directly.
pub struct HealthMetrics {
    registry: Registry,

    /// Signal updates accepted into ingress queues.
    pub updates_total: IntCounter,
    /// Update payload bytes accepted into ingress queues.
    pub bytes_total: IntCounter,
    /// Signal disconnects observed.
    pub disconnects_total: IntCounter,
    /// Malformed updates and source-layer errors discarded.
    pub errors_total: IntCounter,
    /// Updates dropped by ingress queue depth limits.
    pub queue_overflows_total: IntCounter,
    /// Signals currently connected, per table.
    pub signals_connected: IntGaugeVec,
    /// Completed slices emitted, per table assembler.
    pub slices_emitted: IntGaugeVec,
    /// Assembler overflow events, per table (dequeue bound hit or
    /// partials dropped).
    pub assembler_overflows: IntGaugeVec,
    /// Table batches delivered downstream.
    pub batches_published_total: IntCounter,
    /// Table schema rebuilds, including the initial open.
    pub retypes_total: IntCounter,
}

impl HealthMetrics {
    /// Creates the metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let updates_total = IntCounter::with_opts(
            Opts::new(
                "updates_total",
                "Signal updates accepted into ingress queues.",
            )
            .namespace("beamsync"),
        )?;
        let bytes_total = IntCounter::with_opts(
            Opts::new(
                "update_bytes_total",
                "Update payload bytes accepted into ingress queues.",
            )
            .namespace("beamsync"),
        )?;
        let disconnects_total = IntCounter::with_opts(
            Opts::new("disconnects_total", "Signal disconnects observed.")
                .namespace("beamsync"),
        )?;
        let errors_total = IntCounter::with_opts(
            Opts::new(
                "source_errors_total",
                "Malformed updates and source-layer errors discarded.",
            )
            .namespace("beamsync"),
        )?;
        let queue_overflows_total = IntCounter::with_opts(
            Opts::new(
                "queue_overflows_total",
                "Updates dropped by ingress queue depth limits.",
            )
            .namespace("beamsync"),
        )?;
        let signals_connected = IntGaugeVec::new(
            Opts::new("signals_connected", "Signals currently connected, per table.")
                .namespace("beamsync"),
            &["table"],
        )?;
        let slices_emitted = IntGaugeVec::new(
            Opts::new(
                "slices_emitted",
                "Completed slices emitted, per table assembler.",
            )
            .namespace("beamsync"),
            &["table"],
        )?;
        let assembler_overflows = IntGaugeVec::new(
            Opts::new(
                "assembler_overflows",
                "Assembler overflow events, per table.",
            )
            .namespace("beamsync"),
            &["table"],
        )?;
        let batches_published_total = IntCounter::with_opts(
            Opts::new(
                "batches_published_total",
                "Table batches delivered downstream.",
            )
            .namespace("beamsync"),
        )?;
        let retypes_total = IntCounter::with_opts(
            Opts::new(
                "retypes_total",
                "Table schema rebuilds, including the initial open.",
            )
            .namespace("beamsync"),
        )?;

        registry.register(Box::new(updates_total.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(disconnects_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(queue_overflows_total.clone()))?;
        registry.register(Box::new(signals_connected.clone()))?;
        registry.register(Box::new(slices_emitted.clone()))?;
        registry.register(Box::new(assembler_overflows.clone()))?;
        registry.register(Box::new(batches_published_total.clone()))?;
        registry.register(Box::new(retypes_total.clone()))?;

        Ok(Self {
            registry,
            updates_total,
            bytes_total,
            disconnects_total,
            errors_total,
            queue_overflows_total,
            signals_connected,
            slices_emitted,
            assembler_overflows,
            batches_published_total,
            retypes_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let metrics = HealthMetrics::new().expect("metrics");
        metrics.updates_total.inc_by(3);
        metrics.signals_connected.with_label_values(&["BSA:"]).set(2);
        metrics.retypes_total.inc();

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "beamsync_updates_total"));
        assert_eq!(metrics.updates_total.get(), 3);
    }

    #[test]
    fn test_metrics_instances_are_independent() {
        let a = HealthMetrics::new().expect("metrics");
        let b = HealthMetrics::new().expect("metrics");
        a.updates_total.inc();
        assert_eq!(b.updates_total.get(), 0);
    }
}

//! # Prometheus Metrics — Coordinator Exposition
//!
//! Operational metrics in the Prometheus text exposition format, scraped
//! from `GET /metrics`. Gauges are refreshed by the coordinator's 30-second
//! background loop; counters are bumped at the event sites.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ktrdr_operations` | Gauge | `status` | Operations by status |
//! | `ktrdr_workers_connected` | Gauge | — | Workers in the registry |
//! | `ktrdr_workers_available` | Gauge | — | Workers selectable for dispatch |
//! | `ktrdr_checkpoints` | Gauge | — | Stored checkpoints |
//! | `ktrdr_checkpoint_bytes` | Gauge | — | State + artifact bytes stored |
//! | `ktrdr_dispatches` | Counter | `outcome` | Dispatch attempts by outcome |
//! | `ktrdr_operations_orphaned` | Counter | — | Operations failed as ORPHANED |

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: String,
}

pub struct Metrics {
    pub registry: Registry,
    pub operations_by_status: Family<StatusLabel, Gauge>,
    pub workers_connected: Gauge,
    pub workers_available: Gauge,
    pub checkpoints: Gauge,
    pub checkpoint_bytes: Gauge,
    pub dispatches: Family<OutcomeLabel, Counter>,
    pub operations_orphaned: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let operations_by_status = Family::<StatusLabel, Gauge>::default();
        registry.register(
            "ktrdr_operations",
            "Operations by status",
            operations_by_status.clone(),
        );

        let workers_connected = Gauge::default();
        registry.register(
            "ktrdr_workers_connected",
            "Workers currently in the registry",
            workers_connected.clone(),
        );

        let workers_available = Gauge::default();
        registry.register(
            "ktrdr_workers_available",
            "Workers selectable for dispatch",
            workers_available.clone(),
        );

        let checkpoints = Gauge::default();
        registry.register("ktrdr_checkpoints", "Stored checkpoints", checkpoints.clone());

        let checkpoint_bytes = Gauge::default();
        registry.register(
            "ktrdr_checkpoint_bytes",
            "Total state plus artifact bytes stored",
            checkpoint_bytes.clone(),
        );

        let dispatches = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "ktrdr_dispatches",
            "Dispatch attempts by outcome",
            dispatches.clone(),
        );

        let operations_orphaned = Counter::default();
        registry.register(
            "ktrdr_operations_orphaned",
            "Operations failed as ORPHANED by the reconciler",
            operations_orphaned.clone(),
        );

        Metrics {
            registry,
            operations_by_status,
            workers_connected,
            workers_available,
            checkpoints,
            checkpoint_bytes,
            dispatches,
            operations_orphaned,
        }
    }

    pub fn record_dispatch(&self, outcome: &str) {
        self.dispatches
            .get_or_create(&OutcomeLabel {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = encode(&mut out, &self.registry);
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

use crate::ebpf::sweeper::SweepStats;
use crate::proxy::pipeline::PipelineState;
use crate::proxy::tap::Direction;
use crate::{InterposeError, Result};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Proxy-wide counters. Cloning is cheap; clones share the same series.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    accepted: IntCounter,
    accept_errors: IntCounter,
    failed: IntCounterVec,
    closed: IntCounter,
    bytes_relayed: IntCounterVec,
    observations: IntCounterVec,
    registry_entries: IntGauge,
    registry_evictions: IntCounter,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let accepted = IntCounter::with_opts(Opts::new(
            "interpose_connections_accepted_total",
            "Redirected connections accepted by the proxy",
        ))
        .map_err(metrics_error)?;
        let accept_errors = IntCounter::with_opts(Opts::new(
            "interpose_accept_errors_total",
            "Failed accept() calls on the proxy listener",
        ))
        .map_err(metrics_error)?;
        let failed = IntCounterVec::new(
            Opts::new(
                "interpose_connections_failed_total",
                "Connections that ended in the Errored state, by the state they failed in",
            ),
            &["state"],
        )
        .map_err(metrics_error)?;
        let closed = IntCounter::with_opts(Opts::new(
            "interpose_connections_closed_total",
            "Connections relayed to completion",
        ))
        .map_err(metrics_error)?;
        let bytes_relayed = IntCounterVec::new(
            Opts::new("interpose_bytes_relayed_total", "Bytes relayed, by direction"),
            &["direction"],
        )
        .map_err(metrics_error)?;
        let observations = IntCounterVec::new(
            Opts::new(
                "interpose_observations_total",
                "Decoded HTTP messages, by direction",
            ),
            &["direction"],
        )
        .map_err(metrics_error)?;
        let registry_entries = IntGauge::with_opts(Opts::new(
            "interpose_registry_entries",
            "Live entries in the interception registry at the last sweep",
        ))
        .map_err(metrics_error)?;
        let registry_evictions = IntCounter::with_opts(Opts::new(
            "interpose_registry_evictions_total",
            "Registry entries evicted by the idle sweeper",
        ))
        .map_err(metrics_error)?;

        registry.register(Box::new(accepted.clone())).map_err(metrics_error)?;
        registry.register(Box::new(accept_errors.clone())).map_err(metrics_error)?;
        registry.register(Box::new(failed.clone())).map_err(metrics_error)?;
        registry.register(Box::new(closed.clone())).map_err(metrics_error)?;
        registry.register(Box::new(bytes_relayed.clone())).map_err(metrics_error)?;
        registry.register(Box::new(observations.clone())).map_err(metrics_error)?;
        registry.register(Box::new(registry_entries.clone())).map_err(metrics_error)?;
        registry.register(Box::new(registry_evictions.clone())).map_err(metrics_error)?;

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            accepted,
            accept_errors,
            failed,
            closed,
            bytes_relayed,
            observations,
            registry_entries,
            registry_evictions,
        })
    }

    pub fn connection_accepted(&self) {
        self.accepted.inc();
    }

    pub fn accept_failed(&self) {
        self.accept_errors.inc();
    }

    pub fn connection_failed(&self, state: PipelineState) {
        self.failed.with_label_values(&[state.as_str()]).inc();
    }

    pub fn connection_closed(&self) {
        self.closed.inc();
    }

    /// Counter for bytes pumped in `direction`
    pub fn bytes_counter(&self, direction: Direction) -> IntCounter {
        self.bytes_relayed.with_label_values(&[direction.as_str()])
    }

    pub fn observations_counter(&self, direction: Direction) -> IntCounter {
        self.observations.with_label_values(&[direction.as_str()])
    }

    pub fn record_sweep(&self, stats: &SweepStats) {
        self.registry_entries.set(stats.remaining as i64);
        self.registry_evictions.inc_by(stats.evicted as u64);
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted.get()
    }

    pub fn failed_total(&self, state: PipelineState) -> u64 {
        self.failed.with_label_values(&[state.as_str()]).get()
    }

    pub fn closed_total(&self) -> u64 {
        self.closed.get()
    }

    /// Prometheus text exposition of every series
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(metrics_error)
    }
}

fn metrics_error(e: prometheus::Error) -> InterposeError {
    InterposeError::Metrics(e.to_string())
}

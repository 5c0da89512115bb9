use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::stats::{ServerReachability, Stat, StatsSink};

/// [`StatsSink`] backed by a channel-owned prometheus registry.
///
/// Cloning shares the registry, so the embedder can keep a clone for
/// [`PrometheusStats::gather`] after handing one to the channel.
#[derive(Clone)]
pub struct PrometheusStats {
    registry: Registry,
    stats: IntCounterVec,
    reachability: IntCounterVec,
    forward_rtt: HistogramVec,
    forward_bytes: IntCounterVec,
}

impl PrometheusStats {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Self {
        let stats = IntCounterVec::new(
            Opts::new(
                "webchannel_stat_events_total",
                "Channel stat events by name",
            ),
            &["stat"],
        )
        .expect("valid stat counter definition");
        let reachability = IntCounterVec::new(
            Opts::new(
                "webchannel_server_reachability_total",
                "Server reachability events observed by requests",
            ),
            &["event"],
        )
        .expect("valid reachability counter definition");
        let forward_rtt = HistogramVec::new(
            HistogramOpts::new(
                "webchannel_forward_rtt_seconds",
                "Forward-channel POST round trip latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["retries"],
        )
        .expect("valid rtt histogram definition");
        let forward_bytes = IntCounterVec::new(
            Opts::new(
                "webchannel_forward_bytes_total",
                "Bytes posted on the forward channel",
            ),
            &["retries"],
        )
        .expect("valid forward bytes counter definition");

        for collector in [
            Box::new(stats.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reachability.clone()),
            Box::new(forward_rtt.clone()),
            Box::new(forward_bytes.clone()),
        ] {
            if let Err(err) = registry.register(collector) {
                warn!(target = "webchannel.metrics", error = %err, "failed to register collector");
            }
        }

        Self {
            registry,
            stats,
            reachability,
            forward_rtt,
            forward_bytes,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stat_count(&self, stat: Stat) -> u64 {
        self.stats.with_label_values(&[stat.as_str()]).get()
    }

    pub fn reachability_count(&self, event: ServerReachability) -> u64 {
        self.reachability.with_label_values(&[event.as_str()]).get()
    }

    /// Renders the registry in the prometheus text exposition format.
    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            warn!(target = "webchannel.metrics", error = %err, "metrics encode error");
        }
        buffer
    }
}

impl Default for PrometheusStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for PrometheusStats {
    fn stat(&self, stat: Stat) {
        self.stats.with_label_values(&[stat.as_str()]).inc();
    }

    fn reachability(&self, event: ServerReachability) {
        self.reachability.with_label_values(&[event.as_str()]).inc();
    }

    fn timing(&self, size: usize, rtt: Duration, retries: u32) {
        let label = retries.to_string();
        self.forward_rtt
            .with_label_values(&[label.as_str()])
            .observe(rtt.as_secs_f64());
        self.forward_bytes
            .with_label_values(&[label.as_str()])
            .inc_by(size as u64);
    }
}

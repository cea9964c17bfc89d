//! Prometheus metrics for client health probing
//!
//! Heartbeat counters and latency gauges are created lazily against the
//! process-wide default registry; [`register_metrics`] re-registers them
//! into a caller-supplied registry when one is wired into the builder.

use lazy_static::lazy_static;
use prometheus::{GaugeVec, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Successful relay heartbeats, labelled by relay address.
    pub static ref HEARTBEAT_SUCCESS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "client_http_heartbeat_success",
            "Number of successful relay heartbeats"
        ),
        &["http_address"],
    )
    .expect("heartbeat success metric");

    /// Failed relay heartbeats, labelled by relay address.
    pub static ref HEARTBEAT_FAILURE: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "client_http_heartbeat_failure",
            "Number of failed relay heartbeats"
        ),
        &["http_address"],
    )
    .expect("heartbeat failure metric");

    /// Observed relay lag in milliseconds: wall clock at heartbeat
    /// response minus the expected emission time of the served round.
    pub static ref HEARTBEAT_LAG: GaugeVec = GaugeVec::new(
        Opts::new(
            "client_http_heartbeat_lag_ms",
            "Relay lag behind the round schedule in milliseconds"
        ),
        &["http_address"],
    )
    .expect("heartbeat lag metric");

    /// Beacons dropped because a subscriber buffer was full.
    pub static ref WATCH_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "client_watch_dropped_total",
            "Beacons dropped on full subscriber buffers"
        ),
        &["source"],
    )
    .expect("watch dropped metric");
}

/// Register the client metrics into `registry`.
///
/// Registration errors are reported once; callers re-using a registry
/// across clients may ignore them.
pub fn register_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(HEARTBEAT_SUCCESS.clone()))?;
    registry.register(Box::new(HEARTBEAT_FAILURE.clone()))?;
    registry.register(Box::new(HEARTBEAT_LAG.clone()))?;
    registry.register(Box::new(WATCH_DROPPED.clone()))?;
    Ok(())
}

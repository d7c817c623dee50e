//! Prometheus metric contract for the scale-down pipeline.
//!
//! Metric names are part of the external interface; dashboards and alerts
//! reference them by name. Everything registers against a crate-owned
//! registry served by the reconcile command's HTTP endpoint.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static SCALEDOWN_BLOCKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "scaledown_blocked_total",
            "Scale-down candidates rejected by a safety predicate, by reason code",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static SAFETY_CHECK_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "safety_check_failures_total",
            "Safety predicate failures, by check type",
        ),
        &["check_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DRAIN_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new(
            "node_drain_duration_seconds",
            "Wall-clock duration of node drains, by outcome",
        ),
        &["result"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

pub static DRAIN_PODS_EVICTED: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "node_drain_pods_evicted",
            "Pods evicted per node drain",
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

pub static SCALE_DOWN_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "scale_down_errors_total",
            "Scale-down failures surfaced to the reconciler, by error type",
        ),
        &["error_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static TERMINATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "node_termination_duration_seconds",
        "Duration from termination start to provider-confirmed VM deletion",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

pub static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "nodegroup_reconcile_total",
        "Total NodeGroup reconciliation cycles",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "nodegroup_reconcile_errors_total",
        "Total NodeGroup reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "nodegroup_reconcile_duration_seconds",
        "Duration of each NodeGroup reconciliation cycle",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Force-init every metric so all series appear on /metrics from startup.
pub fn force_init() {
    LazyLock::force(&SCALEDOWN_BLOCKED);
    LazyLock::force(&SAFETY_CHECK_FAILURES);
    LazyLock::force(&DRAIN_DURATION);
    LazyLock::force(&DRAIN_PODS_EVICTED);
    LazyLock::force(&SCALE_DOWN_ERRORS);
    LazyLock::force(&TERMINATION_DURATION);
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_metrics_registered() {
        force_init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        for expected in [
            "scaledown_blocked_total",
            "safety_check_failures_total",
            "node_drain_duration_seconds",
            "node_drain_pods_evicted",
            "scale_down_errors_total",
            "node_termination_duration_seconds",
            "nodegroup_reconcile_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "{expected} missing");
        }
    }

    #[test]
    fn test_blocked_counter_labels() {
        SCALEDOWN_BLOCKED.with_label_values(&["protected"]).inc();
        assert!(SCALEDOWN_BLOCKED.with_label_values(&["protected"]).get() >= 1);
    }
}

//! Application metrics.
//!
//! Everything is recorded through the `metrics` facade; the binary installs
//! a Prometheus recorder and `/metrics` renders its handle. Without an
//! installed recorder the calls are no-ops, which keeps library tests quiet.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use crate::domain::{Action, DecisionStage};

pub const DECISIONS_TOTAL: &str = "edgeguard_decisions_total";
pub const DECISION_LATENCY: &str = "edgeguard_decision_latency_seconds";
pub const RULE_ERRORS_TOTAL: &str = "edgeguard_rule_eval_errors_total";
pub const PUBLISHES_TOTAL: &str = "edgeguard_policy_publishes_total";
pub const POLICY_RELOADS_TOTAL: &str = "edgeguard_policy_reloads_total";
pub const MITIGATIONS_TOTAL: &str = "edgeguard_mitigations_total";
pub const MITIGATION_LATENCY: &str = "edgeguard_mitigation_latency_seconds";
pub const DECISION_STAGE_TOTAL: &str = "edgeguard_decision_stage_total";
pub const LOG_DROPPED_TOTAL: &str = "edgeguard_log_records_dropped_total";

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    ::metrics::describe_counter!(DECISIONS_TOTAL, "Evaluated requests by action");
    ::metrics::describe_histogram!(
        DECISION_LATENCY,
        ::metrics::Unit::Seconds,
        "Rule matcher evaluation latency"
    );
    ::metrics::describe_counter!(
        RULE_ERRORS_TOTAL,
        "Rules skipped because their predicate could not be evaluated"
    );
    ::metrics::describe_counter!(PUBLISHES_TOTAL, "Policy publish attempts by outcome");
    ::metrics::describe_counter!(POLICY_RELOADS_TOTAL, "Policy file reloads by outcome");
    ::metrics::describe_counter!(MITIGATIONS_TOTAL, "Mitigation pushes by outcome");
    ::metrics::describe_histogram!(
        MITIGATION_LATENCY,
        ::metrics::Unit::Seconds,
        "Time from push to visible mitigation"
    );
    ::metrics::describe_counter!(
        DECISION_STAGE_TOTAL,
        "Decisions reaching each lifecycle stage after evaluation"
    );
    ::metrics::describe_counter!(LOG_DROPPED_TOTAL, "Decision records dropped by reason");
}

/// Install the global Prometheus recorder.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Allow => "allow",
        Action::Block => "block",
    }
}

/// Record an evaluated request and its latency.
pub fn record_decision(action: Action, started: Instant) {
    ::metrics::counter!(DECISIONS_TOTAL, "action" => action_label(action)).increment(1);
    ::metrics::histogram!(DECISION_LATENCY).record(started.elapsed().as_secs_f64());
}

/// Record a rule skipped on an evaluation error.
pub fn record_rule_error() {
    ::metrics::counter!(RULE_ERRORS_TOTAL).increment(1);
}

/// Record a publish attempt (`applied`, `conflict` or `rejected`).
pub fn record_publish(outcome: &'static str) {
    ::metrics::counter!(PUBLISHES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a policy reload.
pub fn record_policy_reload(success: bool) {
    let outcome = if success { "success" } else { "error" };
    ::metrics::counter!(POLICY_RELOADS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a mitigation push (`applied`, `invalid`, `conflict`, `timeout`).
pub fn record_mitigation(outcome: &'static str, started: Instant) {
    ::metrics::counter!(MITIGATIONS_TOTAL, "outcome" => outcome).increment(1);
    if outcome == "applied" {
        ::metrics::histogram!(MITIGATION_LATENCY).record(started.elapsed().as_secs_f64());
    }
}

/// Record decisions reaching `stage`. `Aggregated` counts once per KPI
/// query that includes the record.
pub fn record_stage(stage: DecisionStage, count: usize) {
    ::metrics::counter!(DECISION_STAGE_TOTAL, "stage" => stage.as_str()).increment(count as u64);
}

/// Record dropped decision records (`overflow`, `timeout`, `delivery`, `closed`).
pub fn record_log_dropped(reason: &'static str, count: usize) {
    ::metrics::counter!(LOG_DROPPED_TOTAL, "reason" => reason).increment(count as u64);
}

//! Integration tests for telemetry initialization and span helpers.

use dispatch_rs::model::{Origin, WorkId};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // init returning Err is acceptable here.
    let config = dispatch_rs::telemetry::TelemetryConfig::new("dispatch-test");
    let _guard = dispatch_rs::telemetry::init_telemetry(config);
}

#[test]
fn work_span_records_transition_and_outcome() {
    let span = dispatch_rs::telemetry::work::start_work_span(Origin::CronJob, WorkId::new(), 1);
    dispatch_rs::telemetry::work::record_state_transition(&span, "pending", "in_flight");
    dispatch_rs::telemetry::work::record_outcome(&span, "succeeded");
}

#[test]
fn metric_instruments_build_against_noop_provider() {
    use opentelemetry::KeyValue;
    dispatch_rs::telemetry::metrics::work_admitted()
        .add(1, &[KeyValue::new("result", "accepted")]);
    dispatch_rs::telemetry::metrics::execution_duration_ms().record(12.5, &[]);
    dispatch_rs::telemetry::metrics::cron_fired().add(1, &[]);
}

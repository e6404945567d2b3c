//! Prometheus metrics

use crate::domain::shared::{DomainError, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter with an HTTP listener on `listen`
pub fn init_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| DomainError::Config(format!("invalid metrics.listen '{}': {}", listen, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| DomainError::Config(format!("failed to install metrics exporter: {}", e)))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_gauge!(
        "meshcall_active_peer_sessions",
        "Number of peer sessions in the registry"
    );
    describe_counter!("meshcall_offers_sent_total", "Total number of offers sent");
    describe_counter!(
        "meshcall_answers_sent_total",
        "Total number of answers sent"
    );
    describe_counter!(
        "meshcall_ice_restarts_total",
        "Total number of ICE restarts requested"
    );
    describe_counter!(
        "meshcall_full_resets_total",
        "Total number of full local resets"
    );
    describe_counter!(
        "meshcall_negotiation_errors_total",
        "Total number of failed offer/answer rounds"
    );
    describe_counter!(
        "meshcall_signaling_reconnects_total",
        "Total number of signaling reconnections"
    );
}

/// Update the active peer session gauge
pub fn update_active_sessions(count: usize) {
    gauge!("meshcall_active_peer_sessions").set(count as f64);
}

pub fn record_offer_sent() {
    counter!("meshcall_offers_sent_total").increment(1);
}

pub fn record_answer_sent() {
    counter!("meshcall_answers_sent_total").increment(1);
}

pub fn record_ice_restart() {
    counter!("meshcall_ice_restarts_total").increment(1);
}

pub fn record_full_reset() {
    counter!("meshcall_full_resets_total").increment(1);
}

/// Record a failed round, labelled by the error category
pub fn record_negotiation_error(category: &str) {
    counter!("meshcall_negotiation_errors_total", "category" => category.to_string())
        .increment(1);
}

pub fn record_signaling_reconnect() {
    counter!("meshcall_signaling_reconnects_total").increment(1);
}

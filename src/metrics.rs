use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::OnceCell;

/// Global metrics handle to ensure single initialization
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Open multi-relay subscriptions
pub fn active_subscriptions() -> Gauge {
    metrics::gauge!("active_subscriptions")
}

/// Failed relay connection attempts
pub fn relay_connection_failures() -> Counter {
    metrics::counter!("relay_connection_failures")
}

/// Events that reached their publish quorum
pub fn events_published() -> Counter {
    metrics::counter!("events_published")
}

/// Events that never reached their publish quorum
pub fn publish_failures() -> Counter {
    metrics::counter!("publish_failures")
}

/// Rejected or failed NIP-42 handshakes
pub fn auth_failures() -> Counter {
    metrics::counter!("auth_failures")
}

/// Keys per replaceable-event loader batch
pub fn loader_batch_size() -> Histogram {
    metrics::histogram!("loader_batch_size")
}

/// Requests forwarded to the nostr.json upstream, by status
pub fn nip05_proxy_requests(status: u16) -> Counter {
    metrics::counter!("nip05_proxy_requests", "status" => status.to_string())
}

/// Sets up the Prometheus recorder and returns a handle that can be used
/// to expose the /metrics endpoint.
pub fn setup_metrics() -> Result<PrometheusHandle, anyhow::Error> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    METRICS_HANDLE
        .get_or_try_init(|| {
            describe_gauge!(
                "active_subscriptions",
                "Number of open multi-relay subscriptions"
            );
            describe_counter!(
                "relay_connection_failures",
                "Total number of failed relay connection attempts"
            );
            describe_counter!(
                "events_published",
                "Total number of events accepted by at least a third of their relays"
            );
            describe_counter!(
                "publish_failures",
                "Total number of events that never reached their publish quorum"
            );
            describe_counter!("auth_failures", "Total number of failed NIP-42 handshakes");
            describe_histogram!(
                "loader_batch_size",
                "Number of keys resolved per replaceable-event batch"
            );
            describe_counter!(
                "nip05_proxy_requests",
                "Requests forwarded to the nostr.json upstream by response status"
            );

            let builder = PrometheusBuilder::new();
            let handle = builder.install_recorder()?;
            Ok(handle)
        })
        .cloned()
}

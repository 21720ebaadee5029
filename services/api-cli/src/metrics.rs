//! Prometheus recorder for the CLI process

use api_client::metrics::DURATION_BUCKETS;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `api_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram rather than a summary.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("api_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

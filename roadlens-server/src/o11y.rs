use metrics_exporter_prometheus::PrometheusBuilder;
use miette::{Context, IntoDiagnostic};
use std::net::SocketAddr;

pub(crate) const METRIC_HTTP_REQUESTS: &str = "roadlens_http_requests";

pub(super) fn init(address: SocketAddr) -> miette::Result<()> {
    let builder = PrometheusBuilder::new();
    builder
        .with_http_listener(address)
        .install()
        .into_diagnostic()
        .wrap_err("Failed to start prometheus metrics exporter")?;

    metrics::describe_counter!(
        METRIC_HTTP_REQUESTS,
        metrics::Unit::Count,
        "Number of requests to HTTP endpoints"
    );

    Ok(())
}

//! Process-wide logging and metrics setup shared by both binaries

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::errors::{AppError, Result};
use crate::metrics::{register_metrics, GENERATION_BUCKETS, LATENCY_BUCKETS};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `observability.log_level` when set.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Serve Prometheus metrics on `observability.metrics_port` and describe them
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let to_config_error = |e: metrics_exporter_prometheus::BuildError| AppError::Configuration {
        message: format!("Failed to install metrics exporter: {}", e),
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(to_config_error)?
        .set_buckets_for_metric(
            Matcher::Suffix("job_duration_seconds".to_string()),
            GENERATION_BUCKETS,
        )
        .map_err(to_config_error)?
        .set_buckets_for_metric(
            Matcher::Suffix("model_call_duration_seconds".to_string()),
            GENERATION_BUCKETS,
        )
        .map_err(to_config_error)?
        .install()
        .map_err(to_config_error)?;

    register_metrics();
    tracing::info!(%addr, service = %config.service_name, "Metrics exporter listening");
    Ok(())
}

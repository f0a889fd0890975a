//! Process telemetry: tracing subscriber and Prometheus recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

/// Dependency crates whose chatter drowns out the request path at `info`.
/// `RUST_LOG` can still raise any of them for a debugging session.
const DEPENDENCY_LOG_CAPS: &[&str] = &["sqlx=warn", "redis=warn", "hyper=warn"];

/// Install the process-wide tracing subscriber.
///
/// The configured level is the default directive; `RUST_LOG` layers on top
/// so an operator can turn up a single target (say `staffetta::relay`)
/// without touching configuration files.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    for cap in DEPENDENCY_LOG_CAPS {
        if let Ok(directive) = cap.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let base = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default());

    let installed = match logging.format {
        LogFormat::Json => base
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Compact => base.with(fmt::layer().compact().with_target(true)).try_init(),
    };

    installed.map_err(|err| {
        InfraError::telemetry(format!("tracing subscriber already installed: {err}"))
    })
}

/// Install the process-wide Prometheus recorder and return the render handle
/// backing the `/metrics` endpoint.
pub fn init_metrics() -> Result<PrometheusHandle, InfraError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| InfraError::telemetry(format!("failed to install metrics recorder: {err}")))
}

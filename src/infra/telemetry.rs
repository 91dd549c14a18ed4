use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::render::metric_names;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so rendered HTML on stdout stays clean.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            metric_names::RENDER_MS,
            Unit::Milliseconds,
            "Markdown render latency (compile and sanitise) in milliseconds."
        );
        describe_counter!(
            metric_names::HIGHLIGHT_FALLBACK_TOTAL,
            Unit::Count,
            "Code blocks rendered as escaped plaintext after a highlighting failure."
        );
        describe_counter!(
            metric_names::DEBOUNCE_SUPERSEDED_TOTAL,
            Unit::Count,
            "Submissions discarded because a newer value arrived within the quiet period."
        );
        describe_counter!(
            metric_names::IMAGE_RESOLVE_FAILED_TOTAL,
            Unit::Count,
            "Image sources left unchanged because resolution failed."
        );
    });
}

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SAMPLING_ENV: &str = "SWEEP_OTEL_SAMPLING_RATE";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Flushes the OTLP pipeline when dropped.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the global subscriber: env filter, console output and, when an
/// OTLP endpoint is configured, an OpenTelemetry exporter.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_ENV).ok().as_deref());

    let (tracer, otel_error) = if env::var_os(OTLP_ENDPOINT_ENV).is_some() {
        match build_tracer(service_name, sampling_rate) {
            Ok(tracer) => (tracer, None),
            Err(error) => (None, Some(error)),
        }
    } else {
        (None, None)
    };

    let guard = TelemetryGuard {
        tracer_installed: tracer.is_some(),
    };

    tracing_subscriber::registry()
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }

    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }

    info!(
        sampling_rate,
        otlp = guard.tracer_installed,
        "telemetry configured"
    );

    Ok(guard)
}

fn build_tracer(service_name: &str, sampling_rate: f64) -> Result<Option<trace::Tracer>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let endpoint = env::var(OTLP_ENDPOINT_ENV)?;
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracer))
}

pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some(format!("{SAMPLING_ENV} is empty; defaulting to 1.0")),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_ENV}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "{SAMPLING_ENV}='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::{build_tracer, parse_sampling_rate, OTLP_ENDPOINT_ENV};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tracer_pipeline_builds_from_endpoint() {
        std::env::set_var(OTLP_ENDPOINT_ENV, "http://127.0.0.1:4317");
        let tracer = build_tracer("sweep-daemon-test", 1.0).unwrap();
        assert!(tracer.is_some());

        let disabled = build_tracer("sweep-daemon-test", 0.0).unwrap();
        assert!(disabled.is_none());
    }

    #[test]
    fn parse_valid_sampling_rate() {
        assert_eq!(parse_sampling_rate(None), (1.0, None));
        assert_eq!(parse_sampling_rate(Some("0.25")), (0.25, None));
        assert_eq!(parse_sampling_rate(Some("0")), (0.0, None));
    }

    #[test]
    fn parse_out_of_bounds_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("1.5"));
        assert_eq!(rate, 1.0);
        assert!(warning
            .unwrap()
            .contains("SWEEP_OTEL_SAMPLING_RATE=1.5 outside 0.0..=1.0"));

        let (rate, warning) = parse_sampling_rate(Some("-0.3"));
        assert_eq!(rate, 0.0);
        assert!(warning.unwrap().contains("clamped to 0"));
    }

    #[test]
    fn parse_invalid_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("abc"));
        assert_eq!(rate, 1.0);
        assert!(warning
            .unwrap()
            .contains("SWEEP_OTEL_SAMPLING_RATE='abc' is not a valid float"));
    }

    #[test]
    fn parse_empty_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("   "));
        assert_eq!(rate, 1.0);
        assert!(warning
            .unwrap()
            .contains("SWEEP_OTEL_SAMPLING_RATE is empty; defaulting to 1.0"));
    }
}

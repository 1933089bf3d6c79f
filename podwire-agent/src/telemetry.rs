use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::{
    trace::{BatchSpanProcessor, SdkTracerProvider},
    Resource,
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const SERVICE_NAME: &str = "podwire-agent";

/// Initialize stdout logging, plus OTLP span export when `otlp` is set.
///
/// The returned provider must be kept alive for the duration of the program
/// and shut down before exit to flush remaining spans.
///
/// Configuration is via standard environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` (default: `http://localhost:4317`)
/// - `RUST_LOG` (default: `info`)
pub fn init_telemetry(otlp: bool) -> Result<Option<SdkTracerProvider>> {
    let fmt_layer = fmt::layer().with_target(false).with_level(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !otlp {
        Registry::default().with(filter).with(fmt_layer).init();
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build();

    let exporter = SpanExporter::builder().with_tonic().build()?;

    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .build();

    let otel_layer = OpenTelemetryLayer::new(provider.tracer(SERVICE_NAME));

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Ok(Some(provider))
}

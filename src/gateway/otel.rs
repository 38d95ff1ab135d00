//! Process-wide `tracing` setup: env filter, plain or JSON output, and an OTLP span
//! exporter when built with `gateway-otel`.

use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Keeps the exporter alive; dropping it flushes and shuts the provider down.
#[derive(Debug, Default)]
pub struct TracingGuard {
    #[cfg(feature = "gateway-otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        #[cfg(feature = "gateway-otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

#[cfg(not(feature = "gateway-otel"))]
pub fn init_tracing(
    _service_name: &str,
    _otlp_endpoint: Option<&str>,
    json_logs: bool,
) -> Result<TracingGuard, Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .try_init()?;
    Ok(TracingGuard::default())
}

#[cfg(feature = "gateway-otel")]
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    json_logs: bool,
) -> Result<TracingGuard, Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
    use opentelemetry_sdk::Resource;

    let Some(endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer(json_logs))
            .try_init()?;
        return Ok(TracingGuard::default());
    };

    let exporter = SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.to_string())
        .build()?;
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder_empty()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .with(otel_layer)
        .try_init()?;
    Ok(TracingGuard {
        provider: Some(provider),
    })
}

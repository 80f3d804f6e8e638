use crate::{config::Config, logger, mode::Mode};
use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer, TracerProviderBuilder},
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug, warn};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};
use ulid::Ulid;

const AXIOM_ENDPOINT: &str = "https://api.axiom.co";

/// Tracer provider handle; [`Telemetry::shutdown`] flushes pending spans.
#[derive(Debug, Default)]
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Flush and shut down the exporter (noop if tracing is disabled).
    pub fn shutdown(&self) {
        if let Some(tp) = &self.provider {
            debug!("shutting down tracer provider");
            if let Err(err) = tp.shutdown() {
                warn!("tracer provider shutdown failed: {err}");
            }
        }
    }
}

/// Resolved OTLP destination.
#[derive(Debug, PartialEq, Eq)]
struct Exporter {
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl Exporter {
    /// Where spans go: an explicit OTLP endpoint wins, `AXIOM_API_TOKEN` alone targets
    /// Axiom with the token and dataset as headers. `None` disables tracing.
    fn resolve(
        endpoint: Option<String>,
        headers: Option<&str>,
        axiom_token: Option<String>,
        dataset: &str,
    ) -> Option<Self> {
        let mut headers = headers.map(otlp_headers).unwrap_or_default();
        let endpoint = match (endpoint, axiom_token) {
            (Some(endpoint), _) => with_scheme(&endpoint),
            (None, Some(token)) => {
                set_default(&mut headers, "authorization", format!("Bearer {token}"));
                set_default(&mut headers, "x-axiom-dataset", dataset.to_string());
                AXIOM_ENDPOINT.to_string()
            }
            (None, None) => return None,
        };
        Some(Self { endpoint, headers })
    }

    #[cfg(test)]
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn tls_domain(&self) -> Option<&str> {
        let authority = self.endpoint.strip_prefix("https://")?.split('/').next()?;
        authority.split(':').next().filter(|host| !host.is_empty())
    }

    /// `-bin` keys carry base64 values and become binary metadata.
    fn metadata(&self) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if name.ends_with("-bin") {
                let raw = general_purpose::STANDARD
                    .decode(value)
                    .map_err(|e| anyhow!("{name}: value is not base64: {e}"))?;
                let key = MetadataKey::<Binary>::from_bytes(name.as_bytes())
                    .map_err(|e| anyhow!("{name}: invalid metadata key: {e}"))?;
                metadata.insert_bin(key, MetadataValue::from_bytes(&raw));
            } else {
                let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
                    .map_err(|e| anyhow!("{name}: invalid metadata key: {e}"))?;
                let value = value
                    .parse::<MetadataValue<Ascii>>()
                    .map_err(|e| anyhow!("{name}: invalid metadata value: {e}"))?;
                metadata.insert(key, value);
            }
        }
        Ok(metadata)
    }
}

/// `OTEL_EXPORTER_OTLP_HEADERS` format: `k1=v1,k2=v2`; pairs without `=` are dropped.
fn otlp_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn set_default(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    if !headers.iter().any(|(key, _)| key.eq_ignore_ascii_case(name)) {
        headers.push((name.to_string(), value));
    }
}

// gRPC collectors default to TLS
fn with_scheme(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    }
}

fn init_tracer(config: &Config, exporter: &Exporter) -> Result<(Tracer, SdkTracerProvider)> {
    if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL")
        && protocol != "grpc"
    {
        debug!("OTEL_EXPORTER_OTLP_PROTOCOL={protocol} ignored, exporting over grpc");
    }

    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(exporter.endpoint.as_str())
        .with_compression(Compression::Gzip)
        .with_timeout(Duration::from_secs(3));

    if let Some(domain) = exporter.tls_domain() {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain.to_string())
                .with_native_roots(),
        );
    }
    if !exporter.headers.is_empty() {
        builder = builder.with_metadata(exporter.metadata()?);
    }

    let span_exporter = builder.build()?;

    let trace_provider = tracer_provider(
        config,
        SdkTracerProvider::builder().with_batch_exporter(span_exporter),
    );

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok((trace_provider.tracer(env!("CARGO_PKG_NAME")), trace_provider))
}

/// The provider is owned by [`Telemetry`] and only reaches tracing through the
/// tracer handed to the OpenTelemetry layer.
fn tracer_provider(config: &Config, builder: TracerProviderBuilder) -> SdkTracerProvider {
    let instance_id = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    builder
        .with_resource(
            Resource::builder_empty()
                .with_attributes(vec![
                    KeyValue::new("service.name", config.app_service.clone()),
                    KeyValue::new("service.namespace", config.app_name.clone()),
                    KeyValue::new("service.version", config.app_version.clone()),
                    KeyValue::new("service.instance.id", instance_id),
                    KeyValue::new("deployment.environment", config.mode.as_str()),
                ])
                .build(),
        )
        .build()
}

/// Install the global subscriber: the mode's log format, optional OTLP tracing and
/// the level filter (`RUST_LOG` wins over `verbosity_level`).
///
/// # Errors
///
/// Returns an error if tracer or subscriber initialization fails
pub fn init(mode: Mode, verbosity_level: Option<Level>, config: &Config) -> Result<Telemetry> {
    let verbosity_level = verbosity_level.unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("h2=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("tower=error".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    let exporter = Exporter::resolve(
        var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
        var("OTEL_EXPORTER_OTLP_HEADERS").ok().as_deref(),
        var("AXIOM_API_TOKEN").ok().filter(|v| !v.is_empty()),
        var("AXIOM_DATASET")
            .as_deref()
            .unwrap_or(config.app_service.as_str()),
    );

    let (otel_layer, provider) = match exporter {
        Some(exporter) => {
            let (tracer, provider) = init_tracer(config, &exporter)?;
            (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                Some(provider),
            )
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(logger::layer(mode))
        .with(otel_layer)
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(Telemetry { provider })
}

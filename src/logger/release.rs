use std::io;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::{Layer, fmt, registry::LookupSpan};

/// JSON lines on stdout. Span events reach OpenTelemetry through the tracing layer
/// installed next to this one.
pub fn layer<S>() -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    json_layer(Mutex::new(io::stdout()))
}

pub(super) fn json_layer<S, W>(writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(writer)
        .boxed()
}

//! Structured logging.
//!
//! Two variants share one set of call sites: debug mode writes a coloured human
//! format ([`DebugFormat`]), release mode writes JSON lines. Records carrying
//! `log.kind = "http"`, `"grpc"` or `"sql"` are request, RPC and query records.
//!
//! Values wrapped in [`Redacted`] never reach either sink.

mod debug;
mod headers;
mod redact;
mod release;

pub use debug::{DebugFormat, highlight_sql};
pub use headers::{HeaderBlock, is_sensitive};
pub use redact::{REDACTED, Redacted};

use crate::mode::Mode;
use std::{io, sync::Mutex};
use tracing::Subscriber;
use tracing_subscriber::{Layer, fmt, registry::LookupSpan};

/// The formatting layer for `mode`.
pub fn layer<S>(mode: Mode) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match mode {
        Mode::Debug => fmt::layer()
            .event_format(DebugFormat)
            .with_writer(Mutex::new(io::stdout()))
            .boxed(),
        Mode::Release => release::layer(),
    }
}

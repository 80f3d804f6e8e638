//! # Keel (runtime substrate for dual-mode services)
//!
//! `keel` is the shared infrastructure that business services (identity, payments)
//! plug into. It owns process startup and shutdown, database lifecycle, background
//! jobs, HTTP/gRPC serving, logging, tracing and email.
//!
//! ## Live and Test
//!
//! Every service runs against two physically separate infrastructures: `live` and
//! `test`. Each inbound request carries an [`OperationMode`] inside its
//! [`RequestContext`]; stores pick their database by indexing the [`Container`]
//! with that context on every call.
//!
//! - **Safe default:** a request is `test` unless it presents a trusted signal
//!   (a live API key, or a trusted dashboard origin asking for live explicitly).
//! - **Isolation:** live and test each get their own writer, readers and job queue.
//!
//! ## Mode
//!
//! [`Mode`] (`debug` / `release`) is fixed at startup from `APP_ENV`. It selects the
//! log format, enables the per-request `X-Debug` switch and the mailer preview, and
//! gates developer-only CLI verbs (`db:seed`, `gen:migration`).
//!
//! ## Startup
//!
//! The `start` command builds a [`Container`] (config, tracer, databases, workers,
//! mailer), spawns the HTTP server, gRPC server and workers, and tears everything down
//! in reverse order on `SIGINT`/`SIGTERM` within a bounded deadline.

pub mod api;
pub mod authz;
pub mod cli;
pub mod config;
pub mod container;
pub mod context;
pub mod database;
pub mod error;
pub mod fs;
pub mod grpc;
pub mod i18n;
pub mod logger;
pub mod mailer;
pub mod mode;
pub mod service;
pub mod storage;
pub mod worker;

pub use container::Container;
pub use context::RequestContext;
pub use error::{Error, ErrorKind, Result};
pub use mode::{Mode, OperationMode};

pub const GIT_COMMIT_HASH: &str = env!("KEEL_GIT_SHA");

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

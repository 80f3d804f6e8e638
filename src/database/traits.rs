//! Capability traits over a [`Database`](super::Database).
//!
//! Stores depend on the narrowest capability they use so tests can hand them a
//! double instead of a full database.

use super::migrate::MigrationStatus;
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use std::{future::Future, path::PathBuf, time::Duration};

pub trait Reader: Send + Sync {
    /// A read-only pool; the writer when no reader is configured.
    fn reader(&self) -> &PgPool;
}

pub trait Writer: Send + Sync {
    fn writer(&self) -> &PgPool;
}

pub trait Transactor: Send + Sync {
    fn with_tx<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send;

    fn with_tx_timeout<T, F>(&self, deadline: Duration, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send;
}

#[async_trait]
pub trait Migrator: Send + Sync {
    fn identifier(&self) -> &str;

    /// Apply pending migrations; returns the file names applied by this call.
    async fn migrate(&self) -> Result<Vec<String>>;

    async fn migrate_status(&self) -> Result<MigrationStatus>;

    /// Create an empty migration file in the source tree.
    fn gen_migration(&self, name: &str) -> Result<PathBuf>;
}

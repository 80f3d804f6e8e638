//! Database layer.
//!
//! A [`Database`] is one logical database of one service in one operation mode: a
//! writer pool, zero or more reader pools, its migration set and an optional seeder.
//!
//! - The writer always exists; [`Database::reader`] falls back to it.
//! - Readers that fail to connect at startup are logged and skipped.
//! - Migrations only ever run up; `migrate` and `migrate_status` are serialised by a
//!   read/write lock.

pub mod migrate;
pub mod query_log;
pub mod traits;
pub mod tx;
pub mod url;

pub use migrate::{Migration, MigrationStatus};
pub use query_log::observe;
pub use traits::{Migrator, Reader, Transactor, Writer};

use crate::{
    error::{Error, Result},
    fs::SharedFs,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use include_dir::{Dir, include_dir};
use rand::seq::SliceRandom;
use sqlx::{
    Connection, PgConnection, PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{
    fmt,
    future::Future,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info, info_span, warn};

/// Migrations shipped with the crate: `worker/` holds the job queue schema, `primary/`
/// the platform service schema.
pub static EMBEDDED_MIGRATIONS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/migrations");

/// Populates a database inside a transaction.
pub type Seeder =
    Arc<dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// What a service declares about one of its databases; URLs come from configuration.
#[derive(Clone)]
pub struct DatabaseSpec {
    pub identifier: String,
    pub migrations: SharedFs,
    pub seeder: Option<Seeder>,
    /// Source-tree migrations root used by `gen:migration`.
    pub source_dir: Option<PathBuf>,
}

impl DatabaseSpec {
    pub fn new(identifier: impl Into<String>, migrations: SharedFs) -> Self {
        Self {
            identifier: identifier.into(),
            migrations,
            seeder: None,
            source_dir: None,
        }
    }

    #[must_use]
    pub fn with_seeder(mut self, seeder: Seeder) -> Self {
        self.seeder = Some(seeder);
        self
    }

    #[must_use]
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }
}

impl fmt::Debug for DatabaseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSpec")
            .field("identifier", &self.identifier)
            .field("seeder", &self.seeder.is_some())
            .field("source_dir", &self.source_dir)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct DatabaseConfig {
    identifier: String,
    writer_url: Option<String>,
    reader_urls: Vec<String>,
    migrations: Option<SharedFs>,
    seeder: Option<Seeder>,
    source_dir: Option<PathBuf>,
    acquire_timeout: Option<Duration>,
}

impl DatabaseConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    /// Start from a service declaration.
    #[must_use]
    pub fn from_spec(spec: &DatabaseSpec) -> Self {
        Self {
            identifier: spec.identifier.clone(),
            migrations: Some(spec.migrations.clone()),
            seeder: spec.seeder.clone(),
            source_dir: spec.source_dir.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_writer_url(mut self, url: impl Into<String>) -> Self {
        self.writer_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_reader_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reader_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_migrations(mut self, migrations: SharedFs) -> Self {
        self.migrations = Some(migrations);
        self
    }

    #[must_use]
    pub fn with_seeder(mut self, seeder: Seeder) -> Self {
        self.seeder = Some(seeder);
        self
    }

    #[must_use]
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .acquire_timeout(self.acquire_timeout.unwrap_or(Duration::from_secs(5)))
            .test_before_acquire(true)
    }

    /// Build the database.
    ///
    /// The writer pool connects lazily; readers are connected now and skipped with a
    /// warning when they cannot be reached.
    ///
    /// # Errors
    /// Fails on a missing identifier, writer URL or migrations source, an unparseable
    /// URL, or an unlistable migrations directory.
    pub async fn connect(self) -> Result<Database> {
        if self.identifier.trim().is_empty() {
            return Err(Error::configuration("database identifier is required"));
        }
        let writer_url = self
            .writer_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::configuration(format!("{}: writer url is required", self.identifier))
            })?;
        let migrations_fs = self.migrations.clone().ok_or_else(|| {
            Error::configuration(format!("{}: migrations source is required", self.identifier))
        })?;

        let migrations = migrate::load(migrations_fs.as_ref(), &self.identifier).map_err(|err| {
            Error::configuration(format!("{}: cannot load migrations: {err}", self.identifier))
        })?;

        let writer = url::parse(writer_url)?;
        let writer_options = connect_options(&writer.connect)?;
        let writer_pool = writer
            .pool
            .apply(self.pool_options())
            .connect_lazy_with(writer_options);

        let mut readers = Vec::with_capacity(self.reader_urls.len());
        for (index, raw) in self.reader_urls.iter().enumerate() {
            let reader = url::parse(raw)?;
            let options = connect_options(&reader.connect)?;
            let span = info_span!(
                "db.connect",
                db.system = "postgresql",
                db.name = %self.identifier,
                db.reader = index
            );
            match reader
                .pool
                .apply(self.pool_options())
                .connect_with(options)
                .instrument(span)
                .await
            {
                Ok(pool) => readers.push(pool),
                Err(err) => {
                    warn!(db = %self.identifier, reader = index, "skipping reader: {err}");
                }
            }
        }

        info!(
            db = %self.identifier,
            readers = readers.len(),
            migrations = migrations.len(),
            "database configured"
        );

        Ok(Database {
            identifier: self.identifier,
            writer: writer_pool,
            readers,
            migrator_url: writer.connect,
            migrations,
            seeder: self.seeder,
            source_dir: self.source_dir,
            migrator_lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

fn connect_options(url: &str) -> Result<PgConnectOptions> {
    PgConnectOptions::from_str(url)
        .map_err(|err| Error::configuration(format!("invalid database url: {err}")))
}

pub struct Database {
    identifier: String,
    writer: PgPool,
    readers: Vec<PgPool>,
    migrator_url: String,
    migrations: Vec<Migration>,
    seeder: Option<Seeder>,
    source_dir: Option<PathBuf>,
    migrator_lock: RwLock<()>,
    closed: AtomicBool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("identifier", &self.identifier)
            .field("readers", &self.readers.len())
            .field("migrations", &self.migrations.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Database {
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn writer(&self) -> &PgPool {
        &self.writer
    }

    /// A uniformly random reader, or the writer when none is available.
    #[must_use]
    pub fn reader(&self) -> &PgPool {
        self.readers
            .choose(&mut rand::thread_rng())
            .unwrap_or(&self.writer)
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Close every pool. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(db = %self.identifier, "closing database pools");
        self.writer.close().await;
        for reader in &self.readers {
            reader.close().await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ping the writer, then every reader; the first failure is returned.
    pub async fn health_check(&self) -> Result<()> {
        ping(&self.writer).await?;
        for reader in &self.readers {
            ping(reader).await?;
        }
        Ok(())
    }

    pub async fn migrate(&self) -> Result<Vec<String>> {
        let _guard = self.migrator_lock.write().await;
        let pool = self.migrator_pool().await?;
        let result = migrate::run(&pool, &self.identifier, &self.migrations).await;
        pool.close().await;
        result
    }

    pub async fn migrate_status(&self) -> Result<MigrationStatus> {
        let _guard = self.migrator_lock.read().await;
        let pool = self.migrator_pool().await?;
        let result = migrate::status(&pool, &self.identifier, &self.migrations).await;
        pool.close().await;
        result
    }

    /// Write an empty migration into `<source_dir>/<identifier>/`.
    pub fn gen_migration(&self, name: &str) -> Result<PathBuf> {
        if name.trim().is_empty() {
            return Err(Error::validation("migration name must not be empty"));
        }
        let root = self.source_dir.as_ref().ok_or_else(|| {
            Error::configuration(format!(
                "{}: no source migrations directory configured",
                self.identifier
            ))
        })?;
        migrate::generate(&root.join(&self.identifier), name, chrono::Utc::now())
    }

    #[must_use]
    pub fn has_seeder(&self) -> bool {
        self.seeder.is_some()
    }

    /// Run the seeder inside a transaction.
    pub async fn seed(&self) -> Result<()> {
        let seeder = self.seeder.clone().ok_or_else(|| {
            Error::configuration(format!("{}: no seeder registered", self.identifier))
        })?;
        tx::with_tx(&self.writer, move |conn| seeder(conn)).await?;
        info!(db = %self.identifier, "seeded");
        Ok(())
    }

    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        tx::with_tx(&self.writer, f).await
    }

    pub async fn with_tx_timeout<T, F>(&self, deadline: Duration, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        tx::with_tx_timeout(&self.writer, deadline, f).await
    }

    async fn migrator_pool(&self) -> Result<PgPool> {
        let options = connect_options(&self.migrator_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(pool)
    }
}

async fn ping(pool: &PgPool) -> Result<()> {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let mut conn = pool.acquire().instrument(acquire_span).await?;
    let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
    conn.ping().instrument(ping_span).await?;
    Ok(())
}

impl Reader for Database {
    fn reader(&self) -> &PgPool {
        Database::reader(self)
    }
}

impl Writer for Database {
    fn writer(&self) -> &PgPool {
        Database::writer(self)
    }
}

impl Transactor for Database {
    fn with_tx<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        tx::with_tx(&self.writer, f)
    }

    fn with_tx_timeout<T, F>(
        &self,
        deadline: Duration,
        f: F,
    ) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        tx::with_tx_timeout(&self.writer, deadline, f)
    }
}

#[async_trait]
impl Migrator for Database {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn migrate(&self) -> Result<Vec<String>> {
        Database::migrate(self).await
    }

    async fn migrate_status(&self) -> Result<MigrationStatus> {
        Database::migrate_status(self).await
    }

    fn gen_migration(&self, name: &str) -> Result<PathBuf> {
        Database::gen_migration(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;

    fn migrations_fs() -> Result<(tempfile::TempDir, SharedFs)> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("primary"))?;
        std::fs::write(
            dir.path().join("primary/20240101000000_init.sql"),
            "-- migrate:up\nCREATE TABLE t (id int);\n-- migrate:down\nDROP TABLE t;\n",
        )?;
        let fs: SharedFs = Arc::new(LocalFs::new(dir.path()));
        Ok((dir, fs))
    }

    #[tokio::test]
    async fn reader_falls_back_to_writer() -> Result<()> {
        let (_dir, fs) = migrations_fs()?;
        let db = DatabaseConfig::new("primary")
            .with_writer_url("postgres://app:pw@127.0.0.1:1/app?pool_max_conns=2")
            .with_migrations(fs)
            .connect()
            .await?;

        assert_eq!(db.reader_count(), 0);
        assert!(std::ptr::eq(db.reader(), db.writer()));
        assert_eq!(db.migrations().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_readers_are_skipped() -> Result<()> {
        let (_dir, fs) = migrations_fs()?;
        let db = DatabaseConfig::new("primary")
            .with_writer_url("postgres://app:pw@127.0.0.1:1/app")
            .with_reader_urls(["postgres://app:pw@127.0.0.1:1/replica"])
            .with_acquire_timeout(Duration::from_millis(200))
            .with_migrations(fs)
            .connect()
            .await?;
        assert_eq!(db.reader_count(), 0);
        assert!(std::ptr::eq(db.reader(), db.writer()));
        Ok(())
    }

    #[tokio::test]
    async fn construction_validates_inputs() -> Result<()> {
        let (_dir, fs) = migrations_fs()?;

        let missing_writer = DatabaseConfig::new("primary")
            .with_migrations(fs.clone())
            .connect()
            .await;
        assert_eq!(
            missing_writer.err().map(|e| e.kind()),
            Some(crate::ErrorKind::Configuration)
        );

        let bad_url = DatabaseConfig::new("primary")
            .with_writer_url("::not a url::")
            .with_migrations(fs.clone())
            .connect()
            .await;
        assert_eq!(
            bad_url.err().map(|e| e.kind()),
            Some(crate::ErrorKind::Configuration)
        );

        let no_migrations = DatabaseConfig::new("primary")
            .with_writer_url("postgres://127.0.0.1:1/app")
            .connect()
            .await;
        assert!(no_migrations.is_err());

        let unlistable = DatabaseConfig::new("billing")
            .with_writer_url("postgres://127.0.0.1:1/app")
            .with_migrations(fs)
            .connect()
            .await;
        assert_eq!(
            unlistable.err().map(|e| e.kind()),
            Some(crate::ErrorKind::Configuration)
        );
        Ok(())
    }

    #[tokio::test]
    async fn close_is_idempotent_and_seed_needs_seeder() -> Result<()> {
        let (_dir, fs) = migrations_fs()?;
        let db = DatabaseConfig::new("primary")
            .with_writer_url("postgres://127.0.0.1:1/app")
            .with_migrations(fs)
            .connect()
            .await?;

        let seeded = db.seed().await;
        assert_eq!(
            seeded.err().map(|e| e.kind()),
            Some(crate::ErrorKind::Configuration)
        );
        assert!(db.gen_migration("").is_err());
        assert!(db.gen_migration("add things").is_err());

        db.close().await;
        db.close().await;
        assert!(db.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn gen_migration_writes_into_identifier_dir() -> Result<()> {
        let (dir, fs) = migrations_fs()?;
        let db = DatabaseConfig::new("primary")
            .with_writer_url("postgres://127.0.0.1:1/app")
            .with_migrations(fs)
            .with_source_dir(dir.path())
            .connect()
            .await?;

        let path = db.gen_migration("Add refunds")?;
        assert!(path.starts_with(dir.path().join("primary")));
        assert!(path.to_string_lossy().ends_with("_add_refunds.sql"));
        Ok(())
    }
}

//! Schema migrations.
//!
//! Files are named `<version>_<name>.sql` where the version is a UTC
//! `YYYYMMDDHHMMSS` timestamp, and carry `-- migrate:up` / `-- migrate:down`
//! sections. Only the up section is ever executed. Applied versions are recorded per
//! migration set in `schema_migrations`; each pending migration runs in its own
//! transaction together with its bookkeeping row.

use crate::{
    error::{Error, Result},
    fs::FileSource,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tracing::{Instrument, debug, info, info_span};

const UP_MARKER: &str = "-- migrate:up";
const DOWN_MARKER: &str = "-- migrate:down";

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        identifier TEXT NOT NULL,
        version TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (identifier, version)
    )
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
}

impl Migration {
    /// Parse a migration file.
    ///
    /// # Errors
    /// Fails when the name has no numeric version prefix or the up section is missing.
    pub fn parse(file_name: &str, contents: &str) -> Result<Self> {
        let stem = file_name
            .strip_suffix(".sql")
            .ok_or_else(|| Error::validation(format!("{file_name}: not a .sql file")))?;
        let (version, name) = stem
            .split_once('_')
            .ok_or_else(|| Error::validation(format!("{file_name}: expected <version>_<name>.sql")))?;
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::validation(format!(
                "{file_name}: version must be numeric"
            )));
        }

        let up_start = contents
            .find(UP_MARKER)
            .ok_or_else(|| Error::validation(format!("{file_name}: missing {UP_MARKER}")))?;
        let after_up = &contents[up_start + UP_MARKER.len()..];
        let (up, down) = match after_up.find(DOWN_MARKER) {
            Some(index) => (
                &after_up[..index],
                Some(after_up[index + DOWN_MARKER.len()..].trim().to_string()),
            ),
            None => (after_up, None),
        };

        Ok(Self {
            version: version.to_string(),
            name: name.to_string(),
            up: up.trim().to_string(),
            down,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}_{}.sql", self.version, self.name)
    }
}

/// Load and order every `.sql` file in `dir`.
///
/// # Errors
/// Fails when the directory cannot be listed, a file is malformed, or two files share
/// a version.
pub fn load(fs: &dyn FileSource, dir: &str) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for name in fs.list_dir(dir)? {
        if !Path::new(&name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        {
            continue;
        }
        let contents = fs.read_to_string(&format!("{dir}/{name}"))?;
        migrations.push(Migration::parse(&name, &contents)?);
    }
    migrations.sort_by(|a, b| a.version.cmp(&b.version));

    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(Error::validation(format!(
                "duplicate migration version {} in {dir}",
                pair[0].version
            )));
        }
    }
    Ok(migrations)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

impl MigrationStatus {
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

async fn ensure_table(pool: &PgPool) -> Result<()> {
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "CREATE",
        db.statement = CREATE_TABLE
    );
    sqlx::raw_sql(CREATE_TABLE)
        .execute(pool)
        .instrument(span)
        .await?;
    Ok(())
}

async fn applied_versions(pool: &PgPool, identifier: &str) -> Result<BTreeSet<String>> {
    let query = "SELECT version FROM schema_migrations WHERE identifier = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(identifier)
        .fetch_all(pool)
        .instrument(span)
        .await?;
    Ok(rows.iter().map(|row| row.get::<String, _>("version")).collect())
}

/// Compare `migrations` with what the database has recorded.
pub async fn status(
    pool: &PgPool,
    identifier: &str,
    migrations: &[Migration],
) -> Result<MigrationStatus> {
    ensure_table(pool).await?;
    let applied = applied_versions(pool, identifier).await?;

    let mut status = MigrationStatus::default();
    for migration in migrations {
        if applied.contains(&migration.version) {
            status.applied.push(migration.file_name());
        } else {
            status.pending.push(migration.file_name());
        }
    }
    Ok(status)
}

/// Apply pending migrations in version order and return the applied file names.
///
/// Each migration takes a transaction-scoped advisory lock on its migration set, so
/// concurrent migrators serialise and never apply a version twice.
pub async fn run(pool: &PgPool, identifier: &str, migrations: &[Migration]) -> Result<Vec<String>> {
    ensure_table(pool).await?;
    let applied = applied_versions(pool, identifier).await?;

    let mut done = Vec::new();
    for migration in migrations
        .iter()
        .filter(|migration| !applied.contains(&migration.version))
    {
        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("keel:migrate:{identifier}"))
            .execute(&mut *tx)
            .await?;

        let already: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM schema_migrations WHERE identifier = $1 AND version = $2",
        )
        .bind(identifier)
        .bind(&migration.version)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            tx.rollback().await?;
            continue;
        }

        if !migration.up.is_empty() {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "MIGRATE",
                db.statement = migration.up.as_str()
            );
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&migration.up))
                .instrument(span)
                .await
                .map_err(|source| Error::Migration {
                    migration: migration.file_name(),
                    source,
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (identifier, version) VALUES ($1, $2)")
            .bind(identifier)
            .bind(&migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(db = identifier, migration = %migration.file_name(), "applied migration");
        done.push(migration.file_name());
    }

    if done.is_empty() {
        debug!(db = identifier, "schema up to date");
    }
    Ok(done)
}

/// Lower-case, `_`-separated form of a free-text migration name.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// Write an empty migration `<dir>/<timestamp>_<slug>.sql`.
///
/// # Errors
/// Fails when the name has no usable characters or the file cannot be written.
pub fn generate(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(Error::validation("migration name must not be empty"));
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{slug}.sql", now.format("%Y%m%d%H%M%S")));
    if path.exists() {
        return Err(Error::conflict(format!("{} already exists", path.display())));
    }
    std::fs::write(&path, format!("{UP_MARKER}\n\n\n{DOWN_MARKER}\n\n"))?;
    Ok(path)
}

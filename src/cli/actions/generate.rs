use crate::{
    api::openapi::write_documents,
    cli::globals::GlobalArgs,
    container::Container,
    database::MigrationStatus,
    mode::OperationMode,
    service::Service,
};
use anyhow::{Context, Result};
use std::{fmt::Write as _, path::PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct MigrationArgs {
    pub db: String,
    pub name: Option<String>,
    pub list: bool,
}

#[derive(Debug)]
pub struct OpenapiArgs {
    pub dir: PathBuf,
}

/// Create `<source dir>/<db>/<timestamp>_<name>.sql`, or with `--list` print what
/// each operation mode has applied and what is pending.
/// # Errors
/// Returns an error for an unknown database, an empty name or an unreachable database.
pub async fn migration(
    args: MigrationArgs,
    globals: GlobalArgs,
    service: &dyn Service,
) -> Result<()> {
    let container = super::container(&globals, service).await?;
    let result = if args.list {
        list(&container, &args.db).await.map(|report| print!("{report}"))
    } else {
        create(&container, &args).map(|path| println!("{}", path.display()))
    };
    container.shutdown().await;
    result
}

fn create(container: &Container, args: &MigrationArgs) -> Result<PathBuf> {
    let name = args.name.as_deref().context("missing migration name")?;
    // both modes share the same source tree
    let database = container.env_for(OperationMode::Test).database(&args.db)?;
    let path = database
        .gen_migration(name)
        .with_context(|| format!("could not create migration {name}"))?;
    info!(db = %args.db, path = %path.display(), "migration created");
    Ok(path)
}

async fn list(container: &Container, db: &str) -> Result<String> {
    let mut report = String::new();
    for mode in OperationMode::ALL {
        let status = container
            .env_for(mode)
            .database(db)?
            .migrate_status()
            .await
            .with_context(|| format!("{mode} {db}: could not read migration status"))?;
        report.push_str(&render_status(mode, db, &status));
    }
    Ok(report)
}

fn render_status(mode: OperationMode, db: &str, status: &MigrationStatus) -> String {
    let mut out = format!(
        "{mode} {db}: {} applied, {} pending\n",
        status.applied.len(),
        status.pending_count()
    );
    for version in &status.applied {
        let _ = writeln!(out, "  [x] {version}");
    }
    for version in &status.pending {
        let _ = writeln!(out, "  [ ] {version}");
    }
    out
}

/// Write one OpenAPI document per API; no database is touched.
/// # Errors
/// Returns an error if a document cannot be written or two APIs share an sdk id.
pub async fn openapi(args: &OpenapiArgs, globals: GlobalArgs, service: &dyn Service) -> Result<()> {
    let result = write_documents(&args.dir, service.apis())
        .with_context(|| format!("could not write OpenAPI documents to {}", args.dir.display()));
    if let Ok(paths) = &result {
        for path in paths {
            println!("{}", path.display());
        }
    }
    super::flush_tracer(globals.telemetry).await;
    result.map(|_| ())
}

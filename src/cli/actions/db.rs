use crate::{cli::globals::GlobalArgs, container::Container, mode::OperationMode, service::Service};
use anyhow::{Context, Result};
use tracing::info;

/// Migrate live then test; in each, the job queue schema before the service databases.
/// # Errors
/// Returns an error if the container cannot be built or a migration fails.
pub async fn migrate(globals: GlobalArgs, service: &dyn Service) -> Result<()> {
    let container = super::container(&globals, service).await?;
    let result = migrate_all(&container).await;
    container.shutdown().await;
    result
}

async fn migrate_all(container: &Container) -> Result<()> {
    for mode in OperationMode::ALL {
        container
            .env_for(mode)
            .migrate()
            .await
            .with_context(|| format!("{mode} migration failed"))?;
    }
    Ok(())
}

/// Run every registered seeder in both operation modes; databases without one are skipped.
/// # Errors
/// Returns an error if the container cannot be built or a seeder fails.
pub async fn seed(globals: GlobalArgs, service: &dyn Service) -> Result<()> {
    let container = super::container(&globals, service).await?;
    let result = seed_all(&container).await;
    container.shutdown().await;
    result
}

async fn seed_all(container: &Container) -> Result<()> {
    for mode in OperationMode::ALL {
        for database in container.env_for(mode).databases() {
            if !database.has_seeder() {
                info!(mode = %mode, db = %database.identifier(), "no seeder, skipping");
                continue;
            }
            database
                .seed()
                .await
                .with_context(|| format!("{mode} {} seed failed", database.identifier()))?;
        }
    }
    Ok(())
}

pub mod db;
pub mod generate;
pub mod start;

// Internal "interpreter" for `Action`.
mod run;

use crate::{
    cli::{globals::GlobalArgs, telemetry::Telemetry},
    container::{CleanupStack, Container},
    service::Service,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::error;

#[derive(Debug)]
pub enum Action {
    Start(start::Args),
    Migrate,
    Seed,
    GenMigration(generate::MigrationArgs),
    GenOpenapi(generate::OpenapiArgs),
}

impl Action {
    /// Execute the action for `service`.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self, globals: GlobalArgs, service: Arc<dyn Service>) -> Result<()> {
        run::execute(self, globals, service).await
    }
}

/// Build the container with the tracer flush at the bottom of its cleanup stack, so it
/// runs after every database and worker is closed. A failed build still tears down
/// whatever it created.
async fn container(globals: &GlobalArgs, service: &dyn Service) -> Result<Arc<Container>> {
    let cleanup = Arc::new(CleanupStack::new());

    let telemetry = globals.telemetry.clone();
    cleanup.push("tracer", move || flush_tracer(telemetry));

    match Container::build(globals.config.clone(), service, cleanup.clone()).await {
        Ok(container) => Ok(Arc::new(container)),
        Err(err) => {
            cleanup.run().await;
            Err(err).context(format!("failed to build {} container", service.name()))
        }
    }
}

async fn flush_tracer(telemetry: Arc<Telemetry>) {
    // the batch exporter blocks while flushing
    if let Err(err) = tokio::task::spawn_blocking(move || telemetry.shutdown()).await {
        error!("tracer flush failed: {err}");
    }
}

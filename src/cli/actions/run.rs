use crate::{
    cli::{
        actions::{Action, db, generate, start},
        globals::GlobalArgs,
    },
    service::Service,
};
use anyhow::Result;
use std::sync::Arc;

/// Execute the provided action.
// This is the single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action, globals: GlobalArgs, service: Arc<dyn Service>) -> Result<()> {
    match action {
        Action::Start(args) => start::execute(args, globals, service).await,
        Action::Migrate => db::migrate(globals, service.as_ref()).await,
        Action::Seed => db::seed(globals, service.as_ref()).await,
        Action::GenMigration(args) => generate::migration(args, globals, service.as_ref()).await,
        Action::GenOpenapi(args) => generate::openapi(&args, globals, service.as_ref()).await,
    }
}

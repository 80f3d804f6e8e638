use anyhow::Result;
use keel::{cli, service::PlatformService};
use std::sync::Arc;

// Main function
#[tokio::main]
async fn main() -> Result<()> {
    let (action, globals) = cli::start()?;

    action.execute(globals, Arc::new(PlatformService)).await?;

    Ok(())
}

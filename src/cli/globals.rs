use crate::{cli::telemetry::Telemetry, config::Config, mode::Mode};
use std::sync::Arc;

/// What every action receives next to its own arguments.
#[derive(Clone)]
pub struct GlobalArgs {
    pub mode: Mode,
    pub config: Config,
    pub telemetry: Arc<Telemetry>,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(mode: Mode, config: Config, telemetry: Telemetry) -> Self {
        Self {
            mode,
            config,
            telemetry: Arc::new(telemetry),
        }
    }
}

impl std::fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArgs")
            .field("mode", &self.mode)
            .field("app_service", &self.config.app_service)
            .field("smtp_url", &self.config.smtp_url.as_ref().map(|_| "***"))
            .field("tracing", &self.telemetry.is_enabled())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_global_args() {
        let config = Config::parse_from(
            Mode::Release,
            ["keel", "--app-service", "payments", "--smtp-url", "smtp://u:p@mx"],
        )
        .unwrap();
        let args = GlobalArgs::new(Mode::Release, config, Telemetry::default());
        assert_eq!(args.config.app_service, "payments");
        assert!(!args.telemetry.is_enabled());

        let debug = format!("{args:?}");
        assert!(debug.contains("***"));
        assert!(!debug.contains("u:p"));
    }
}

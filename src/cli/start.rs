use crate::{
    cli::{actions::Action, commands, dispatch, globals::GlobalArgs, telemetry},
    config::Config,
    mode::Mode,
};
use anyhow::{Context, Result};
use clap::{ArgMatches, parser::ValueSource};

/// Map verbosity count to tracing level
const fn get_verbosity_level(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// `None` unless `-v` or `KEEL_LOG_LEVEL` was given, leaving the default to telemetry.
fn verbosity(matches: &ArgMatches) -> Option<tracing::Level> {
    match matches.value_source(commands::logging::ARG_VERBOSITY) {
        None | Some(ValueSource::DefaultValue) => None,
        Some(_) => matches
            .get_one::<u8>(commands::logging::ARG_VERBOSITY)
            .copied()
            .map(get_verbosity_level),
    }
}

/// Main entry point for the CLI - builds and returns the Action
///
/// # Errors
///
/// Returns an error if argument parsing, configuration, telemetry initialization, or
/// action dispatch fails
pub fn start() -> Result<(Action, GlobalArgs)> {
    // 1. Load .env (if present) before anything reads the environment
    let _ = dotenvy::dotenv();

    // 2. Parse command-line arguments; debug-only verbs depend on APP_ENV, options fall
    //    back to their environment variables
    let mode = Mode::from_env();
    let matches = commands::new(mode).get_matches();

    // 3. Read the configuration
    let config = Config::from_matches(mode, &matches).context("invalid configuration")?;

    // 4. Initialize telemetry
    let telemetry = telemetry::init(mode, verbosity(&matches), &config)?;

    // 5. Dispatch to appropriate action
    let action = dispatch::handler(&matches)?;

    // 6. Return the action for execution by the binary
    Ok((action, GlobalArgs::new(mode, config, telemetry)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_verbosity_level() {
        assert_eq!(get_verbosity_level(0), tracing::Level::ERROR);
        assert_eq!(get_verbosity_level(2), tracing::Level::INFO);
        assert_eq!(get_verbosity_level(3), tracing::Level::DEBUG);
        assert_eq!(get_verbosity_level(9), tracing::Level::TRACE);
    }

    #[test]
    fn test_verbosity_default_is_unset() {
        temp_env::with_vars([("KEEL_LOG_LEVEL", None::<String>)], || {
            let matches = commands::new(Mode::Release).get_matches_from(vec!["keel", "db:migrate"]);
            assert_eq!(verbosity(&matches), None);

            let matches =
                commands::new(Mode::Release).get_matches_from(vec!["keel", "db:migrate", "-vvv"]);
            assert_eq!(verbosity(&matches), Some(tracing::Level::DEBUG));
        });
    }

    #[test]
    fn test_verbosity_from_env() {
        temp_env::with_vars([("KEEL_LOG_LEVEL", Some("error"))], || {
            let matches = commands::new(Mode::Release).get_matches_from(vec!["keel", "db:migrate"]);
            assert_eq!(verbosity(&matches), Some(tracing::Level::ERROR));
        });
    }
}

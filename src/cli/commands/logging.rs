use clap::{Arg, ArgAction, Command, builder::ValueParser};

pub const ARG_VERBOSITY: &str = "verbosity";

/// Level names in verbosity order; the index is the `-v` count.
const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// `KEEL_LOG_LEVEL` takes either a count (`0..=5`) or a level name.
#[must_use]
pub fn log_level_parser() -> ValueParser {
    ValueParser::from(|raw: &str| -> Result<u8, String> {
        if let Ok(count) = raw.parse::<u8>() {
            return if count <= 5 {
                Ok(count)
            } else {
                Err(format!("log level {count} out of range (0-5)"))
            };
        }
        LEVELS
            .iter()
            .position(|level| level.eq_ignore_ascii_case(raw))
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| format!("invalid log level '{raw}', expected one of {LEVELS:?}"))
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: INFO)")
            .env("KEEL_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(log_level_parser()),
    )
}


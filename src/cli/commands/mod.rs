pub mod db;
pub mod generate;
pub mod logging;
pub mod start;

use crate::mode::Mode;
use clap::{
    ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

/// The command tree; `db:seed` and `gen:migration` exist only in debug mode.
#[must_use]
pub fn new(mode: Mode) -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let mut command = Command::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(start::command())
        .subcommand(db::migrate())
        .subcommand(generate::openapi());

    if mode.is_debug() {
        command = command.subcommand(db::seed()).subcommand(generate::migration());
    }

    crate::config::with_args(logging::with_args(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let command = new(Mode::Debug);

        assert_eq!(command.get_name(), "keel");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some(env!("CARGO_PKG_DESCRIPTION").to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_debug_only_commands() {
        let names = |mode| {
            new(mode)
                .get_subcommands()
                .map(|sub| sub.get_name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(Mode::Debug),
            vec!["start", "db:migrate", "gen:openapi", "db:seed", "gen:migration"]
        );
        assert_eq!(names(Mode::Release), vec!["start", "db:migrate", "gen:openapi"]);

        let result = new(Mode::Release).try_get_matches_from(vec!["keel", "db:seed"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_start_flags() {
        let matches = new(Mode::Release).get_matches_from(vec!["keel", "start", "--worker"]);
        let Some(("start", sub)) = matches.subcommand() else {
            panic!("expected start");
        };
        assert!(sub.get_flag(start::ARG_WORKER));
        assert!(!sub.get_flag(start::ARG_SERVER));
    }

    #[test]
    fn test_gen_migration_args() {
        let command = new(Mode::Debug);
        let matches = command.get_matches_from(vec![
            "keel",
            "gen:migration",
            "--db",
            "primary",
            "create_payments",
        ]);
        let Some((generate::CMD_MIGRATION, sub)) = matches.subcommand() else {
            panic!("expected gen:migration");
        };
        assert_eq!(
            sub.get_one::<String>(generate::ARG_DB).map(String::as_str),
            Some("primary")
        );
        assert_eq!(
            sub.get_one::<String>(generate::ARG_NAME).map(String::as_str),
            Some("create_payments")
        );

        let missing_name =
            new(Mode::Debug).try_get_matches_from(vec!["keel", "gen:migration", "--db", "primary"]);
        assert!(missing_name.is_err());

        let list = new(Mode::Debug).try_get_matches_from(vec![
            "keel",
            "gen:migration",
            "--db",
            "primary",
            "--list",
        ]);
        assert!(list.is_ok());
    }

    #[test]
    fn test_gen_openapi_default_dir() {
        let matches = new(Mode::Release).get_matches_from(vec!["keel", "gen:openapi"]);
        let Some((generate::CMD_OPENAPI, sub)) = matches.subcommand() else {
            panic!("expected gen:openapi");
        };
        assert_eq!(
            sub.get_one::<String>(generate::ARG_DIR).map(String::as_str),
            Some("openapi")
        );
    }

    #[test]
    fn test_check_log_level_env() {
        // loop cover all possible value_parse
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars([("KEEL_LOG_LEVEL", Some(level))], || {
                let matches = new(Mode::Release).get_matches_from(vec!["keel", "db:migrate"]);
                assert_eq!(
                    matches
                        .get_one::<u8>(logging::ARG_VERBOSITY)
                        .map(|s| usize::from(*s)),
                    Some(index)
                );
            });
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        temp_env::with_vars([("KEEL_LOG_LEVEL", None::<String>)], || {
            let matches = new(Mode::Release).get_matches_from(vec!["keel", "start", "-vvv"]);
            assert_eq!(
                matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                Some(3)
            );
        });
    }
}

use crate::cli::{
    actions::{Action, generate, start},
    commands,
};
use anyhow::{Context, Result, bail};
use std::path::PathBuf;

/// # Errors
/// Returns an error if required arguments are missing or the subcommand is unknown.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let action = match matches.subcommand() {
        Some((commands::start::CMD, sub)) => Action::Start(start::Args {
            server: sub.get_flag(commands::start::ARG_SERVER),
            worker: sub.get_flag(commands::start::ARG_WORKER),
        }),
        Some((commands::db::CMD_MIGRATE, _)) => Action::Migrate,
        Some((commands::db::CMD_SEED, _)) => Action::Seed,
        Some((commands::generate::CMD_MIGRATION, sub)) => {
            Action::GenMigration(generate::MigrationArgs {
                db: sub
                    .get_one::<String>(commands::generate::ARG_DB)
                    .cloned()
                    .context("missing required argument: --db")?,
                name: sub.get_one::<String>(commands::generate::ARG_NAME).cloned(),
                list: sub.get_flag(commands::generate::ARG_LIST),
            })
        }
        Some((commands::generate::CMD_OPENAPI, sub)) => {
            Action::GenOpenapi(generate::OpenapiArgs {
                dir: sub
                    .get_one::<String>(commands::generate::ARG_DIR)
                    .map(PathBuf::from)
                    .context("missing required argument: --dir")?,
            })
        }
        Some((other, _)) => bail!("unknown command: {other}"),
        None => bail!("no command given"),
    };
    Ok(action)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mode::Mode;

    fn dispatch(mode: Mode, args: &[&str]) -> Action {
        let matches = commands::new(mode).get_matches_from(args);
        handler(&matches).unwrap()
    }

    #[test]
    fn test_start_defaults_to_everything() {
        let Action::Start(args) = dispatch(Mode::Release, &["keel", "start"]) else {
            panic!("expected start");
        };
        assert!(args.runs_servers());
        assert!(args.runs_workers());

        let Action::Start(args) = dispatch(Mode::Release, &["keel", "start", "--server"]) else {
            panic!("expected start");
        };
        assert!(args.runs_servers());
        assert!(!args.runs_workers());
    }

    #[test]
    fn test_db_commands() {
        assert!(matches!(
            dispatch(Mode::Release, &["keel", "db:migrate"]),
            Action::Migrate
        ));
        assert!(matches!(
            dispatch(Mode::Debug, &["keel", "db:seed"]),
            Action::Seed
        ));
    }

    #[test]
    fn test_gen_commands() {
        let Action::GenMigration(args) = dispatch(
            Mode::Debug,
            &["keel", "gen:migration", "--db", "primary", "--list"],
        ) else {
            panic!("expected gen:migration");
        };
        assert_eq!(args.db, "primary");
        assert!(args.list);
        assert_eq!(args.name, None);

        let Action::GenOpenapi(args) =
            dispatch(Mode::Release, &["keel", "gen:openapi", "--dir", "docs/api"])
        else {
            panic!("expected gen:openapi");
        };
        assert_eq!(args.dir, PathBuf::from("docs/api"));
    }
}

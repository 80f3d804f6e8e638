use clap::{Arg, ArgAction, Command};

pub const CMD_MIGRATION: &str = "gen:migration";
pub const CMD_OPENAPI: &str = "gen:openapi";
pub const ARG_DB: &str = "db";
pub const ARG_LIST: &str = "list";
pub const ARG_NAME: &str = "name";
pub const ARG_DIR: &str = "dir";

#[must_use]
pub fn migration() -> Command {
    Command::new(CMD_MIGRATION)
        .about("Create an empty migration, or list migration status with --list")
        .arg(
            Arg::new(ARG_DB)
                .long("db")
                .help("Database identifier, e.g. primary")
                .value_name("NAME")
                .required(true),
        )
        .arg(
            Arg::new(ARG_LIST)
                .long("list")
                .help("List applied and pending migrations instead of creating one")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_NAME)
                .help("Migration name, e.g. create_payments")
                .required_unless_present(ARG_LIST),
        )
}

#[must_use]
pub fn openapi() -> Command {
    Command::new(CMD_OPENAPI)
        .about("Write one OpenAPI document per API to <dir>/<sdk-id>.json")
        .arg(
            Arg::new(ARG_DIR)
                .long("dir")
                .help("Output directory")
                .value_name("DIR")
                .default_value("openapi"),
        )
}

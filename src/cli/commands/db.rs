use clap::Command;

pub const CMD_MIGRATE: &str = "db:migrate";
pub const CMD_SEED: &str = "db:seed";

#[must_use]
pub fn migrate() -> Command {
    Command::new(CMD_MIGRATE)
        .about("Apply pending migrations to the live and test databases, job queues first")
}

#[must_use]
pub fn seed() -> Command {
    Command::new(CMD_SEED).about("Run the registered seeders against the live and test databases")
}

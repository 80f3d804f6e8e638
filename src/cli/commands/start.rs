use clap::{Arg, ArgAction, Command};

pub const CMD: &str = "start";
pub const ARG_SERVER: &str = "server";
pub const ARG_WORKER: &str = "worker";

#[must_use]
pub fn command() -> Command {
    Command::new(CMD)
        .about("Run the HTTP/gRPC servers and the live and test workers")
        .long_about(
            "Run the HTTP/gRPC servers and the live and test workers. \
             Without --server or --worker both are started.",
        )
        .arg(
            Arg::new(ARG_SERVER)
                .long("server")
                .help("Start the HTTP server (and gRPC when GRPC_PORT is set)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_WORKER)
                .long("worker")
                .help("Start the live and test job workers")
                .action(ArgAction::SetTrue),
        )
}

use crate::{
    api::{self, HttpOptions, HttpServer},
    cli::globals::GlobalArgs,
    config::Config,
    container::Container,
    grpc::GrpcServer,
    service::Service,
    worker::{self, Worker},
};
use anyhow::{Context, Result, anyhow};
use std::{sync::Arc, time::Duration};
use tokio::{signal, task::JoinSet, time::Instant};
use tracing::{error, info};

/// Bound on the whole teardown once a signal (or the first error) arrives.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct Args {
    pub server: bool,
    pub worker: bool,
}

impl Args {
    /// Neither flag means both.
    #[must_use]
    pub fn runs_servers(&self) -> bool {
        self.server || !self.worker
    }

    #[must_use]
    pub fn runs_workers(&self) -> bool {
        self.worker || !self.server
    }
}

/// Execute the start action.
/// # Errors
/// Returns the first error raised by a server or worker, or by building the container.
pub async fn execute(args: Args, globals: GlobalArgs, service: Arc<dyn Service>) -> Result<()> {
    log_startup_args(&args, &globals.config, service.name());

    let container = super::container(&globals, service.as_ref()).await?;
    let result = run(args, &globals.config, &container, service.as_ref()).await;
    container.shutdown().await;
    result
}

#[derive(Default)]
struct Running {
    tasks: JoinSet<Result<()>>,
    http: Option<Arc<HttpServer>>,
    grpc: Option<Arc<GrpcServer>>,
    workers: Vec<Arc<Worker>>,
}

async fn run(
    args: Args,
    config: &Config,
    container: &Arc<Container>,
    service: &dyn Service,
) -> Result<()> {
    let mut running = Running::default();

    let outcome = match spawn(args, config, container, service, &mut running).await {
        Ok(()) => wait(&mut running.tasks).await,
        Err(err) => Err(err),
    };
    if let Err(err) = &outcome {
        error!("aborting: {err:#}");
    }

    shutdown(running).await;
    outcome
}

async fn spawn(
    args: Args,
    config: &Config,
    container: &Arc<Container>,
    service: &dyn Service,
    running: &mut Running,
) -> Result<()> {
    if args.runs_servers() {
        let mut options = HttpOptions::from_config(config);
        if let Some(mailer) = container.mailer() {
            options = options.with_preview(mailer.clone());
        }
        let app = api::app(container.clone(), service.apis(), options);
        let addr = config.socket_addr(config.port)?;
        let http = Arc::new(
            HttpServer::bind(addr, app)
                .await
                .with_context(|| format!("could not bind http on {addr}"))?,
        );
        let serving = http.clone();
        running
            .tasks
            .spawn(async move { serving.listen_and_serve().await.context("http server") });
        running.http = Some(http);

        match (config.grpc_port, service.grpc_routes()) {
            (Some(port), Some(routes)) => {
                let addr = config.socket_addr(port)?;
                let grpc = Arc::new(
                    GrpcServer::bind(addr, routes)
                        .await
                        .with_context(|| format!("could not bind grpc on {addr}"))?,
                );
                let serving = grpc.clone();
                running
                    .tasks
                    .spawn(async move { serving.listen_and_serve().await.context("grpc server") });
                running.grpc = Some(grpc);
            }
            (Some(_), None) => info!("GRPC_PORT set but {} has no gRPC routes", service.name()),
            (None, _) => {}
        }
    }

    if args.runs_workers() {
        for worker in container.workers() {
            worker
                .start()
                .await
                .with_context(|| format!("{} worker", worker.operation_mode()))?;
            running.workers.push(worker);
        }
    }
    Ok(())
}

/// Until a signal, or until a server exits; a server exiting on its own is an error.
async fn wait(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => Err(anyhow!("server stopped unexpectedly")),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(anyhow!("server task failed: {err}")),
        },
    }
}

async fn shutdown(running: Running) {
    let Running {
        mut tasks,
        http,
        grpc,
        workers,
    } = running;
    let deadline = Instant::now() + SHUTDOWN_DEADLINE;
    let remaining = || deadline.saturating_duration_since(Instant::now());

    // Servers first so no new work arrives, then the workers.
    if let Some(http) = http {
        if let Err(err) = http.shutdown(remaining()).await {
            error!("http shutdown: {err}");
        }
        info!(component = "http", "stopped");
    }
    if let Some(grpc) = grpc {
        if let Err(err) = grpc.stop(remaining()).await {
            error!("grpc stop: {err}");
        }
        info!(component = "grpc", "stopped");
    }
    worker::stop_all(&workers, remaining()).await;
    info!(component = "workers", count = workers.len(), "stopped");

    if tokio::time::timeout(remaining(), async {
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(err)) = joined {
                error!("{err:#}");
            }
        }
    })
    .await
    .is_err()
    {
        error!(pending = tasks.len(), "shutdown deadline exceeded, aborting tasks");
        tasks.shutdown().await;
    }
    info!("stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn log_startup_args(args: &Args, config: &Config, service: &str) {
    let entries = [
        ("service", service.to_string()),
        ("mode", config.mode.to_string()),
        ("http", format!("{}:{}", config.host, config.port)),
        (
            "grpc",
            config
                .grpc_port
                .map_or_else(|| "off".to_string(), |port| format!("{}:{port}", config.host)),
        ),
        ("servers", args.runs_servers().to_string()),
        ("workers", args.runs_workers().to_string()),
        ("live_worker", config.live.worker_url.is_some().to_string()),
        ("test_worker", config.test.worker_url.is_some().to_string()),
        (
            "spa_dir",
            config
                .spa_dir
                .as_ref()
                .map_or_else(|| "none".to_string(), |dir| dir.display().to_string()),
        ),
    ];
    info!("{}", startup_message(&entries));
}

fn startup_message(entries: &[(&str, String)]) -> String {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    message
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}

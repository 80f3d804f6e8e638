//! Background job worker.
//!
//! Each operation mode gets its own [`Worker`] bound to its own database
//! (`LIVE_WORKER_DB_URL` / `TEST_WORKER_DB_URL`). Jobs live in `keel_jobs`, created by
//! the embedded `worker` migration set, which `db:migrate` applies before any
//! application schema.
//!
//! The poll loop claims a batch with `FOR UPDATE SKIP LOCKED` so several processes can
//! share a queue, runs the handlers concurrently and records the outcome:
//!
//! - success marks the job `completed`;
//! - an error or panic goes to the [`ErrorHandler`], then the job is rescheduled as
//!   `retryable` with exponential backoff and jitter, or `discarded` once
//!   `max_attempts` is reached;
//! - jobs left `running` longer than `stuck_after` (a crashed process) are claimed again.

pub mod config;
pub mod job;

pub use config::{Backoff, WorkerConfig};
pub use job::{ErrorHandler, HandlerResult, Job, JobHandler, JobRegistry, LoggingErrorHandler};

use crate::{
    context::RequestContext,
    database::{Database, DatabaseConfig, EMBEDDED_MIGRATIONS, MigrationStatus, observe},
    error::{Error, Result},
    fs::{EmbeddedFs, SharedFs},
    mode::OperationMode,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::{PgConnection, Row, postgres::PgRow};
use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Identifier of the queue's migration set.
pub const WORKER_IDENTIFIER: &str = "worker";

const CLAIM: &str = r"
    UPDATE keel_jobs
    SET state = 'running',
        attempt = attempt + 1,
        attempted_at = NOW(),
        updated_at = NOW()
    WHERE id IN (
        SELECT id
        FROM keel_jobs
        WHERE (state IN ('available', 'retryable') AND run_at <= NOW())
           OR (state = 'running' AND attempted_at < NOW() - ($2 * INTERVAL '1 millisecond'))
        ORDER BY run_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, kind, args, attempt, max_attempts
";

const INSERT: &str = r"
    INSERT INTO keel_jobs (id, kind, args, max_attempts, run_at)
    VALUES ($1, $2, $3, $4, $5)
";

const COMPLETE: &str = r"
    UPDATE keel_jobs
    SET state = 'completed',
        last_error = NULL,
        finalized_at = NOW(),
        updated_at = NOW()
    WHERE id = $1
";

const DISCARD: &str = r"
    UPDATE keel_jobs
    SET state = 'discarded',
        last_error = $2,
        finalized_at = NOW(),
        updated_at = NOW()
    WHERE id = $1
";

const RESCHEDULE: &str = r"
    UPDATE keel_jobs
    SET state = 'retryable',
        last_error = $2,
        run_at = NOW() + ($3 * INTERVAL '1 millisecond'),
        updated_at = NOW()
    WHERE id = $1
";

/// The queue schema shipped with the crate.
pub fn migrations() -> SharedFs {
    Arc::new(EmbeddedFs::new(&EMBEDDED_MIGRATIONS))
}

struct Inner {
    operation_mode: OperationMode,
    /// Carries the SQL log switch into every queue query.
    ctx: RequestContext,
    db: Database,
    registry: JobRegistry,
    config: WorkerConfig,
    errors: Arc<dyn ErrorHandler>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Worker {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("operation_mode", &self.inner.operation_mode)
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

pub struct WorkerBuilder {
    operation_mode: OperationMode,
    url: Option<String>,
    debug: bool,
    registry: JobRegistry,
    config: WorkerConfig,
    errors: Arc<dyn ErrorHandler>,
}

impl WorkerBuilder {
    #[must_use]
    pub fn new(operation_mode: OperationMode) -> Self {
        Self {
            operation_mode,
            url: None,
            debug: false,
            registry: JobRegistry::new(),
            config: WorkerConfig::default(),
            errors: Arc::new(LoggingErrorHandler),
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Log every queue statement as a `log.kind = "sql"` record.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, errors: Arc<dyn ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    /// Bind the worker to its database. The pool connects lazily.
    ///
    /// # Errors
    /// Returns a configuration error without a database URL or with an invalid one.
    pub async fn build(self) -> Result<Worker> {
        let url = self
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{} worker: database url is required",
                    self.operation_mode
                ))
            })?;
        let db = DatabaseConfig::new(WORKER_IDENTIFIER)
            .with_writer_url(url)
            .with_migrations(migrations())
            .connect()
            .await?;

        Ok(Worker {
            inner: Arc::new(Inner {
                operation_mode: self.operation_mode,
                ctx: RequestContext::background(self.operation_mode).with_debug(self.debug),
                db,
                registry: self.registry,
                config: self.config.normalized(),
                errors: self.errors,
            }),
            running: Mutex::new(None),
        })
    }
}

impl Worker {
    #[must_use]
    pub fn builder(operation_mode: OperationMode) -> WorkerBuilder {
        WorkerBuilder::new(operation_mode)
    }

    #[must_use]
    pub fn operation_mode(&self) -> OperationMode {
        self.inner.operation_mode
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Apply the queue schema (up only).
    pub async fn migrate(&self) -> Result<Vec<String>> {
        self.inner.db.migrate().await
    }

    pub async fn migrate_status(&self) -> Result<MigrationStatus> {
        self.inner.db.migrate_status().await
    }

    /// Insert a job runnable now. Pass `conn` to enqueue inside a transaction on the
    /// worker database.
    pub async fn enqueue<A: Serialize>(
        &self,
        conn: Option<&mut PgConnection>,
        kind: &str,
        args: &A,
    ) -> Result<Uuid> {
        self.enqueue_at(conn, kind, args, Utc::now()).await
    }

    pub async fn enqueue_at<A: Serialize>(
        &self,
        conn: Option<&mut PgConnection>,
        kind: &str,
        args: &A,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        if kind.trim().is_empty() {
            return Err(Error::validation("job kind must not be empty"));
        }
        let args = serde_json::to_value(args)
            .map_err(|err| Error::validation(format!("job {kind}: cannot encode args: {err}")))?;
        let id = Uuid::now_v7();
        let max_attempts = i32::try_from(self.inner.config.max_attempts).unwrap_or(i32::MAX);

        let logged: [&(dyn fmt::Debug + Sync); 5] = [&id, &kind, &args, &max_attempts, &run_at];
        let query = sqlx::query(INSERT)
            .bind(id)
            .bind(kind)
            .bind(&args)
            .bind(max_attempts)
            .bind(run_at);
        match conn {
            Some(conn) => observe(&self.inner.ctx, INSERT, &logged, query.execute(conn)).await?,
            None => {
                let writer = self.inner.db.writer();
                observe(&self.inner.ctx, INSERT, &logged, query.execute(writer)).await?
            }
        };
        debug!(job.id = %id, job.kind = kind, mode = %self.inner.operation_mode, "job enqueued");
        Ok(id)
    }

    /// Spawn the poll loop.
    ///
    /// # Errors
    /// Returns a conflict when the worker is already running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::conflict(format!(
                "{} worker already started",
                self.inner.operation_mode
            )));
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(poll_loop(inner, shutdown_rx));
        *running = Some(Running { shutdown, handle });
        info!(
            mode = %self.inner.operation_mode,
            kinds = ?self.inner.registry.kinds().collect::<Vec<_>>(),
            "worker started"
        );
        Ok(())
    }

    /// Stop polling and wait for the in-flight batch. A stopped worker can be started again.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        // The receiver is gone only when the loop already exited.
        let _ = running.shutdown.send(true);
        running
            .handle
            .await
            .map_err(|err| Error::Panic(format!("worker loop: {err}")))?;
        info!(mode = %self.inner.operation_mode, "worker stopped");
        Ok(())
    }

    /// Like [`Worker::stop`], but the loop is aborted when the in-flight batch does not
    /// finish within `deadline`; running handlers are dropped mid-flight.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] after aborting.
    pub async fn stop_within(&self, deadline: Duration) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        match tokio::time::timeout(deadline, &mut running.handle).await {
            Ok(joined) => {
                joined.map_err(|err| Error::Panic(format!("worker loop: {err}")))?;
                info!(mode = %self.inner.operation_mode, "worker stopped");
                Ok(())
            }
            Err(_) => {
                running.handle.abort();
                // Wait for the cancelled task so nothing outlives shutdown.
                let _ = running.handle.await;
                warn!(mode = %self.inner.operation_mode, "worker aborted after {deadline:?}");
                Err(Error::Timeout(deadline))
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Claim and run one batch; returns how many jobs were worked.
    pub async fn work_once(&self) -> Result<usize> {
        process_batch(&self.inner).await
    }

    pub async fn close(&self) {
        self.inner.db.close().await;
    }
}

async fn poll_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = inner.config.poll_interval;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let worked = match process_batch(&inner).await {
            Ok(worked) => worked,
            Err(err) => {
                error!(mode = %inner.operation_mode, "job batch failed: {err}");
                0
            }
        };
        // A full batch means more may be waiting; poll again right away.
        if worked >= inner.config.batch_size {
            continue;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                // Sender dropped: the worker handle is gone.
                if changed.is_err() {
                    break;
                }
            }
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

async fn process_batch(inner: &Inner) -> Result<usize> {
    let limit = i64::try_from(inner.config.batch_size).unwrap_or(i64::MAX);
    let stuck_ms = i64::try_from(inner.config.stuck_after.as_millis()).unwrap_or(i64::MAX);
    let claim = sqlx::query(CLAIM)
        .bind(limit)
        .bind(stuck_ms)
        .fetch_all(inner.db.writer());
    let rows = observe(&inner.ctx, CLAIM, &[&limit, &stuck_ms], claim).await?;

    if rows.is_empty() {
        return Ok(0);
    }

    let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
    let count = jobs.len();
    let results = futures::future::join_all(jobs.into_iter().map(|job| run_job(inner, job))).await;
    for result in results {
        if let Err(err) = result {
            error!(mode = %inner.operation_mode, "failed to record job outcome: {err}");
        }
    }
    Ok(count)
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let attempt: i32 = row.try_get("attempt")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        args: row.try_get("args")?,
        attempt: u32::try_from(attempt).unwrap_or(0),
        max_attempts: u32::try_from(max_attempts).unwrap_or(1),
    })
}

/// Run one job and record the outcome.
async fn run_job(inner: &Inner, job: Job) -> Result<()> {
    let span = info_span!(
        "worker.job",
        job.id = %job.id,
        job.kind = %job.kind,
        job.attempt = job.attempt,
        mode = %inner.operation_mode
    );

    let decision = async {
        let Some(handler) = inner.registry.get(&job.kind) else {
            let err = Error::not_found(format!("no handler registered for job kind {}", job.kind));
            return Some((err.to_string(), inner.errors.handle_error(&job, &err)));
        };
        match AssertUnwindSafe(handler.work(&job)).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some((err.to_string(), inner.errors.handle_error(&job, &err))),
            Err(panic) => {
                let message = crate::error::panic_message(panic.as_ref());
                let result = inner.errors.handle_panic(&job, &message);
                Some((format!("panic: {message}"), result))
            }
        }
    }
    .instrument(span.clone())
    .await;

    match decision {
        None => complete(inner, &job).instrument(span).await,
        Some((error, result)) => fail(inner, &job, &error, result).instrument(span).await,
    }
}

async fn complete(inner: &Inner, job: &Job) -> Result<()> {
    let query = sqlx::query(COMPLETE)
        .bind(job.id)
        .execute(inner.db.writer());
    observe(&inner.ctx, COMPLETE, &[&job.id], query).await?;
    debug!(job.id = %job.id, job.kind = %job.kind, "job completed");
    Ok(())
}

async fn fail(inner: &Inner, job: &Job, error: &str, result: HandlerResult) -> Result<()> {
    let delay = match result {
        HandlerResult::Discard => None,
        _ if job.is_last_attempt() => None,
        HandlerResult::RetryAfter(delay) => Some(delay),
        HandlerResult::Neutral => Some(inner.config.backoff.delay(job.attempt)),
    };

    match delay {
        None => {
            let query = sqlx::query(DISCARD)
                .bind(job.id)
                .bind(error)
                .execute(inner.db.writer());
            observe(&inner.ctx, DISCARD, &[&job.id, &error], query).await?;
            info!(job.id = %job.id, job.kind = %job.kind, job.attempt = job.attempt, "job discarded");
        }
        Some(delay) => {
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let query = sqlx::query(RESCHEDULE)
                .bind(job.id)
                .bind(error)
                .bind(delay_ms)
                .execute(inner.db.writer());
            observe(&inner.ctx, RESCHEDULE, &[&job.id, &error, &delay_ms], query).await?;
            debug!(
                job.id = %job.id,
                job.kind = %job.kind,
                retry_in = ?delay,
                "job rescheduled"
            );
        }
    }
    Ok(())
}

/// Stop `workers` in order, logging failures; used during shutdown. A worker still
/// busy after `deadline` is aborted.
pub async fn stop_all(workers: &[Arc<Worker>], deadline: Duration) {
    for worker in workers {
        if let Err(err) = worker.stop_within(deadline).await {
            error!(mode = %worker.operation_mode(), "worker stop failed: {err}");
        }
    }
}

mod common;

use anyhow::Result;
use async_trait::async_trait;
use keel::{
    OperationMode,
    worker::{Job, JobHandler, JobRegistry, Worker, WorkerConfig},
};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing_subscriber::layer::SubscriberExt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Receipt {
    payment: String,
}

#[derive(Default)]
struct Recorder {
    worked: AtomicUsize,
}

#[async_trait]
impl JobHandler for Recorder {
    fn kind(&self) -> &str {
        "send_receipt"
    }

    async fn work(&self, job: &Job) -> keel::Result<()> {
        let receipt: Receipt = job.args()?;
        assert_eq!(receipt.payment, "pay_1");
        self.worked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl JobHandler for Failing {
    fn kind(&self) -> &str {
        "always_fails"
    }

    async fn work(&self, _job: &Job) -> keel::Result<()> {
        Err(keel::Error::transient("provider unavailable"))
    }
}

struct Panicking;

#[async_trait]
impl JobHandler for Panicking {
    fn kind(&self) -> &str {
        "panics"
    }

    async fn work(&self, _job: &Job) -> keel::Result<()> {
        panic!("handler bug")
    }
}

/// Collects formatted log lines.
#[derive(Clone, Default)]
struct Lines(Arc<Mutex<Vec<u8>>>);

impl io::Write for Lines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Lines {
    fn json(&self) -> Vec<serde_json::Value> {
        let raw = self
            .0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// Never finishes on its own; counts how often it was dropped mid-flight.
#[derive(Default)]
struct Stuck {
    started: AtomicUsize,
    dropped: Arc<AtomicUsize>,
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobHandler for Stuck {
    fn kind(&self) -> &str {
        "stuck"
    }

    async fn work(&self, _job: &Job) -> keel::Result<()> {
        let _counter = DropCounter(self.dropped.clone());
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(())
    }
}

async fn worker(url: String, registry: JobRegistry, max_attempts: u32) -> Result<Worker> {
    debug_worker(url, registry, max_attempts, false).await
}

async fn debug_worker(
    url: String,
    registry: JobRegistry,
    max_attempts: u32,
    debug: bool,
) -> Result<Worker> {
    let worker = Worker::builder(OperationMode::Test)
        .with_url(url)
        .with_debug(debug)
        .with_registry(registry)
        .with_config(
            WorkerConfig {
                poll_interval: Duration::from_millis(50),
                max_attempts,
                ..WorkerConfig::default()
            },
        )
        .build()
        .await?;
    worker.migrate().await?;
    Ok(worker)
}

async fn state(worker: &Worker, id: Uuid) -> Result<(String, i32)> {
    let row = sqlx::query("SELECT state, attempt FROM keel_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(worker.database().writer())
        .await?;
    Ok((row.try_get("state")?, row.try_get("attempt")?))
}

#[tokio::test]
async fn poll_loop_completes_jobs() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.register(recorder.clone())?;
    let worker = worker(pg.create_database("queue").await?, registry, 3).await?;

    let id = worker
        .enqueue(
            None,
            "send_receipt",
            &Receipt {
                payment: "pay_1".to_string(),
            },
        )
        .await?;

    worker.start().await?;
    assert!(worker.start().await.is_err());
    for _ in 0..100 {
        if recorder.worked.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker.stop().await?;
    assert!(!worker.is_running().await);

    assert_eq!(recorder.worked.load(Ordering::SeqCst), 1);
    assert_eq!(state(&worker, id).await?, ("completed".to_string(), 1));
    Ok(())
}

#[tokio::test]
async fn enqueue_joins_the_callers_transaction() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let worker = worker(pg.create_database("queue").await?, JobRegistry::new(), 3).await?;

    let mut tx = worker.database().writer().begin().await?;
    worker
        .enqueue(Some(&mut *tx), "send_receipt", &serde_json::json!({}))
        .await?;
    tx.rollback().await?;

    let row = sqlx::query("SELECT COUNT(*) AS n FROM keel_jobs")
        .fetch_one(worker.database().writer())
        .await?;
    assert_eq!(row.try_get::<i64, _>("n")?, 0);
    Ok(())
}

#[tokio::test]
async fn failures_retry_then_discard() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let mut registry = JobRegistry::new();
    registry.register(Arc::new(Failing))?;
    registry.register(Arc::new(Panicking))?;
    let worker = worker(pg.create_database("queue").await?, registry, 2).await?;

    let failing = worker.enqueue(None, "always_fails", &serde_json::json!({})).await?;
    let unknown = worker.enqueue(None, "nobody_handles_this", &serde_json::json!({})).await?;
    assert_eq!(worker.work_once().await?, 2);

    let (state_after_first, attempt) = state(&worker, failing).await?;
    assert_eq!(state_after_first, "retryable");
    assert_eq!(attempt, 1);
    assert_eq!(state(&worker, unknown).await?.0, "retryable");

    // The backoff pushed run_at into the future; nothing is due yet.
    assert_eq!(worker.work_once().await?, 0);

    sqlx::query("UPDATE keel_jobs SET run_at = NOW() WHERE id = $1")
        .bind(failing)
        .execute(worker.database().writer())
        .await?;
    assert_eq!(worker.work_once().await?, 1);
    assert_eq!(state(&worker, failing).await?, ("discarded".to_string(), 2));

    let row = sqlx::query(
        "SELECT last_error, finalized_at IS NOT NULL AS finalized FROM keel_jobs WHERE id = $1",
    )
    .bind(failing)
    .fetch_one(worker.database().writer())
    .await?;
    assert!(row.try_get::<String, _>("last_error")?.contains("provider unavailable"));
    assert!(row.try_get::<bool, _>("finalized")?);

    let panicking = worker.enqueue(None, "panics", &serde_json::json!({})).await?;
    sqlx::query("UPDATE keel_jobs SET attempt = max_attempts - 1 WHERE id = $1")
        .bind(panicking)
        .execute(worker.database().writer())
        .await?;
    assert_eq!(worker.work_once().await?, 1);
    assert_eq!(state(&worker, panicking).await?, ("discarded".to_string(), 2));
    Ok(())
}

#[tokio::test]
async fn debug_worker_logs_its_queries() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let recorder = Arc::new(Recorder::default());
    let mut registry = JobRegistry::new();
    registry.register(recorder.clone())?;
    let worker = debug_worker(pg.create_database("queue").await?, registry, 3, true).await?;
    worker
        .enqueue(
            None,
            "send_receipt",
            &Receipt {
                payment: "pay_1".to_string(),
            },
        )
        .await?;

    let lines = Lines::default();
    let writer = lines.clone();
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(move || writer.clone()),
    );
    let worked = {
        let _guard = tracing::subscriber::set_default(subscriber);
        worker.work_once().await?
    };
    assert_eq!(worked, 1);

    let sql: Vec<String> = lines
        .json()
        .iter()
        .filter(|line| line["log.kind"] == "sql")
        .filter_map(|line| line["db.statement"].as_str().map(str::to_string))
        .collect();
    assert!(sql.iter().any(|statement| statement.contains("FOR UPDATE SKIP LOCKED")));
    assert!(sql.iter().any(|statement| statement.contains("'completed'")));
    Ok(())
}

#[tokio::test]
async fn release_worker_keeps_queries_out_of_the_log() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let worker = worker(pg.create_database("queue").await?, JobRegistry::new(), 3).await?;

    let lines = Lines::default();
    let writer = lines.clone();
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(move || writer.clone()),
    );
    {
        let _guard = tracing::subscriber::set_default(subscriber);
        worker.work_once().await?;
    }
    assert!(lines.json().iter().all(|line| line["log.kind"] != "sql"));
    Ok(())
}

#[tokio::test]
async fn stop_all_aborts_workers_past_the_deadline() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let stuck = Arc::new(Stuck::default());
    let mut registry = JobRegistry::new();
    registry.register(stuck.clone())?;
    let worker = Arc::new(worker(pg.create_database("queue").await?, registry, 3).await?);
    worker.enqueue(None, "stuck", &serde_json::json!({})).await?;

    worker.start().await?;
    for _ in 0..100 {
        if stuck.started.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stuck.started.load(Ordering::SeqCst), 1);

    let stopping = tokio::time::Instant::now();
    keel::worker::stop_all(std::slice::from_ref(&worker), Duration::from_millis(200)).await;
    assert!(stopping.elapsed() < Duration::from_secs(5));
    assert!(!worker.is_running().await);
    assert_eq!(stuck.dropped.load(Ordering::SeqCst), 1);

    // A stopped worker has nothing left to abort.
    worker.stop_within(Duration::from_millis(10)).await?;
    Ok(())
}

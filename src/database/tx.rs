//! Transaction helpers.
//!
//! The body receives the transaction connection and returns a boxed future so the
//! borrow of the connection is expressible:
//!
//! ```ignore
//! db.with_tx(|conn| Box::pin(async move {
//!     sqlx::query("UPDATE payments SET status = 'paid' WHERE id = $1")
//!         .bind(id)
//!         .execute(&mut *conn)
//!         .await?;
//!     Ok(())
//! }))
//! .await?;
//! ```
//!
//! Outcome handling:
//! - `Ok` commits.
//! - `Err` rolls back; a failed rollback is folded into the returned error.
//! - a panic rolls back and then resumes unwinding.
//! - an expired deadline rolls back and returns [`Error::Timeout`].

use crate::error::{Error, Result};
use futures::{FutureExt, future::BoxFuture};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::{panic::AssertUnwindSafe, time::Duration};
use tracing::{Instrument, error, info_span};

/// Run `f` inside a transaction on `pool`.
pub async fn with_tx<T, F>(pool: &PgPool, f: F) -> Result<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
{
    run(pool, None, f).await
}

/// Like [`with_tx`], bounded by `deadline`.
pub async fn with_tx_timeout<T, F>(pool: &PgPool, deadline: Duration, f: F) -> Result<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
{
    run(pool, Some(deadline), f).await
}

async fn run<T, F>(pool: &PgPool, deadline: Option<Duration>, f: F) -> Result<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
{
    let span = info_span!("db.transaction", db.system = "postgresql", db.operation = "BEGIN");
    let mut tx = pool.begin().instrument(span).await?;

    let body = AssertUnwindSafe(f(&mut *tx)).catch_unwind();
    let outcome = match deadline {
        Some(deadline) => {
            let timed = tokio::time::timeout(deadline, body).await;
            match timed {
                Ok(outcome) => outcome,
                Err(_) => return Err(rollback(tx, Error::Timeout(deadline)).await),
            }
        }
        None => body.await,
    };

    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Ok(Err(err)) => Err(rollback(tx, err).await),
        Err(panic) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!("rollback after panic failed: {rollback_err}");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

async fn rollback(tx: Transaction<'_, Postgres>, err: Error) -> Error {
    match tx.rollback().await {
        Ok(()) => err,
        Err(rollback) => Error::Rollback {
            source: Box::new(err),
            rollback,
        },
    }
}

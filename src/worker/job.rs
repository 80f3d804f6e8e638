//! Jobs, handlers and the hooks that decide what happens when a handler fails.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tracing::{error, warn};
use uuid::Uuid;

/// A claimed job as seen by its handler.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub args: serde_json::Value,
    /// 1 on the first run.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Job {
    /// Decode the job arguments.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone())
            .map_err(|err| Error::validation(format!("job {} ({}): bad args: {err}", self.id, self.kind)))
    }

    #[must_use]
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queue kind this handler works, e.g. `"send_receipt"`.
    fn kind(&self) -> &str;

    async fn work(&self, job: &Job) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its kind.
    ///
    /// # Errors
    /// Returns a conflict when the kind is already registered or a validation error for an
    /// empty kind.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<()> {
        let kind = handler.kind().trim().to_string();
        if kind.is_empty() {
            return Err(Error::validation("job kind must not be empty"));
        }
        if self.handlers.contains_key(&kind) {
            return Err(Error::conflict(format!("job kind {kind} registered twice")));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a failure hook wants done with the job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandlerResult {
    /// Follow the normal retry schedule.
    #[default]
    Neutral,
    /// Retry after this delay (still bounded by `max_attempts`).
    RetryAfter(Duration),
    /// Give up now.
    Discard,
}

/// Hooks for failed and panicking jobs.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, job: &Job, err: &Error) -> HandlerResult;

    fn handle_panic(&self, job: &Job, panic: &str) -> HandlerResult;
}

/// Logs failures and leaves the retry decision to the schedule.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, job: &Job, err: &Error) -> HandlerResult {
        warn!(
            job.id = %job.id,
            job.kind = %job.kind,
            job.attempt = job.attempt,
            "job failed: {err}"
        );
        HandlerResult::Neutral
    }

    fn handle_panic(&self, job: &Job, panic: &str) -> HandlerResult {
        error!(
            job.id = %job.id,
            job.kind = %job.kind,
            job.attempt = job.attempt,
            "job panicked: {panic}"
        );
        HandlerResult::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Noop(&'static str);

    #[async_trait]
    impl JobHandler for Noop {
        fn kind(&self) -> &str {
            self.0
        }

        async fn work(&self, _job: &Job) -> Result<()> {
            Ok(())
        }
    }

    fn job(args: serde_json::Value) -> Job {
        Job {
            id: Uuid::nil(),
            kind: "send_receipt".to_string(),
            args,
            attempt: 1,
            max_attempts: 3,
        }
    }

    #[test]
    fn registry_rejects_duplicates_and_empty_kinds() -> Result<()> {
        let mut registry = JobRegistry::new();
        registry.register(Arc::new(Noop("send_receipt")))?;
        let duplicate = registry.register(Arc::new(Noop("send_receipt"))).err();
        assert_eq!(duplicate.map(|e| e.kind()), Some(crate::ErrorKind::Conflict));
        assert!(registry.register(Arc::new(Noop(" "))).is_err());
        assert!(registry.get("send_receipt").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["send_receipt"]);
        Ok(())
    }

    #[test]
    fn decodes_args() -> Result<()> {
        #[derive(Deserialize)]
        struct Receipt {
            payment_id: String,
        }
        let receipt: Receipt = job(serde_json::json!({"payment_id": "pay_1"})).args()?;
        assert_eq!(receipt.payment_id, "pay_1");
        assert!(job(serde_json::json!([1])).args::<Receipt>().is_err());
        Ok(())
    }

    #[test]
    fn default_hooks_are_neutral() {
        let handler = LoggingErrorHandler;
        let job = job(serde_json::Value::Null);
        assert_eq!(
            handler.handle_error(&job, &Error::transient("smtp down")),
            HandlerResult::Neutral
        );
        assert_eq!(handler.handle_panic(&job, "boom"), HandlerResult::Neutral);
    }
}

//! Per-service composition root.
//!
//! A [`Container`] owns everything a service touches at runtime: one [`Environment`]
//! per operation mode (databases and job worker), the mailer, the i18n bundle and the
//! object store. Stores select the environment on every call with
//! [`Container::env`]; they never keep an [`Environment`] across requests.
//!
//! Teardown runs through a [`CleanupStack`]: resources register their close action as
//! they are built and [`Container::shutdown`] runs them in reverse order.

use crate::{
    config::Config,
    context::RequestContext,
    database::{Database, DatabaseConfig},
    error::{Error, Result},
    i18n::Bundle,
    mailer::{LogTransport, MailTransport, Mailer, MailerConfig, SmtpTransport},
    mode::{Mode, OperationMode},
    service::{JobContext, Service},
    storage::{ObjectStore, S3Store},
    worker::Worker,
};
use futures::future::BoxFuture;
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, info, warn};

pub const DEFAULT_LANGUAGE: &str = "en";

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// LIFO list of named teardown actions.
#[derive(Default)]
pub struct CleanupStack {
    entries: Mutex<Vec<(String, CleanupFn)>>,
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field("entries", &self.names())
            .finish()
    }
}

impl CleanupStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cleanup: CleanupFn = Box::new(move || Box::pin(cleanup()));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), cleanup));
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Pop and run every action, newest first. Safe to call more than once.
    pub async fn run(&self) {
        loop {
            let next = self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop();
            let Some((name, cleanup)) = next else {
                break;
            };
            debug!(cleanup = %name, "running cleanup");
            cleanup().await;
        }
    }
}

/// Databases and worker of one operation mode.
#[derive(Debug)]
pub struct Environment {
    operation_mode: OperationMode,
    databases: BTreeMap<String, Arc<Database>>,
    worker: Option<Arc<Worker>>,
}

impl Environment {
    #[must_use]
    pub fn new(operation_mode: OperationMode) -> Self {
        Self {
            operation_mode,
            databases: BTreeMap::new(),
            worker: None,
        }
    }

    #[must_use]
    pub fn with_database(mut self, database: Arc<Database>) -> Self {
        self.databases
            .insert(database.identifier().to_string(), database);
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker: Arc<Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    #[must_use]
    pub fn operation_mode(&self) -> OperationMode {
        self.operation_mode
    }

    /// # Errors
    /// Returns not found for an unknown identifier.
    pub fn database(&self, identifier: &str) -> Result<&Arc<Database>> {
        self.databases.get(identifier).ok_or_else(|| {
            Error::not_found(format!(
                "{} database {identifier}",
                self.operation_mode.as_str()
            ))
        })
    }

    pub fn databases(&self) -> impl Iterator<Item = &Arc<Database>> {
        self.databases.values()
    }

    #[must_use]
    pub fn worker(&self) -> Option<&Arc<Worker>> {
        self.worker.as_ref()
    }

    /// Check every database, then the queue database; the first failure wins.
    pub async fn health_check(&self) -> Result<()> {
        for database in self.databases.values() {
            database.health_check().await?;
        }
        if let Some(worker) = &self.worker {
            worker.database().health_check().await?;
        }
        Ok(())
    }

    /// Queue schema first, then application schemas.
    pub async fn migrate(&self) -> Result<()> {
        if let Some(worker) = &self.worker {
            let applied = worker.migrate().await?;
            info!(mode = %self.operation_mode, db = "worker", applied = applied.len(), "migrated");
        }
        for database in self.databases.values() {
            let applied = database.migrate().await?;
            info!(
                mode = %self.operation_mode,
                db = %database.identifier(),
                applied = applied.len(),
                "migrated"
            );
        }
        Ok(())
    }
}

pub struct Container {
    config: Config,
    service: String,
    live: Environment,
    test: Environment,
    mailer: Option<Arc<Mailer>>,
    bundle: Arc<Bundle>,
    storage: Option<Arc<dyn ObjectStore>>,
    cleanup: Arc<CleanupStack>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("service", &self.service)
            .field("mode", &self.config.mode)
            .field("live", &self.live)
            .field("test", &self.test)
            .field("mailer", &self.mailer.is_some())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Wire `service` against `config`. Every resource created here registers its
    /// teardown on `cleanup`, which the caller keeps so it can tear down a
    /// half-built container too.
    ///
    /// # Errors
    /// Fails on missing database URLs, an invalid SMTP URL or unreadable locales.
    pub async fn build(
        config: Config,
        service: &dyn Service,
        cleanup: Arc<CleanupStack>,
    ) -> Result<Self> {
        let bundle = Arc::new(match service.locales() {
            Some(fs) => Bundle::load(fs.as_ref(), DEFAULT_LANGUAGE)?,
            None => Bundle::empty(DEFAULT_LANGUAGE),
        });

        let mailer = match service.mail_templates() {
            Some(templates) => {
                let transport = mail_transport(&config)?;
                let from = config
                    .mailer_from
                    .clone()
                    .unwrap_or_else(|| format!("{} <no-reply@localhost>", config.app_name));
                Some(Arc::new(
                    Mailer::new(MailerConfig::new(from), templates, transport)
                        .with_bundle(bundle.clone()),
                ))
            }
            None => None,
        };

        let storage: Option<Arc<dyn ObjectStore>> = match &config.storage {
            Some(storage) => Some(Arc::new(S3Store::from_config(storage).await?)),
            None => None,
        };

        let mut environments = Vec::with_capacity(OperationMode::ALL.len());
        for mode in OperationMode::ALL {
            let mut env = Environment::new(mode);

            for spec in service.databases() {
                let database = DatabaseConfig::from_spec(&spec)
                    .with_writer_url(config.writer_url(mode, &spec.identifier)?)
                    .with_reader_urls(config.reader_urls(mode, &spec.identifier).iter())
                    .connect()
                    .await?;
                let database = Arc::new(database);
                let closing = database.clone();
                cleanup.push(format!("{mode}:db:{}", spec.identifier), move || async move {
                    closing.close().await;
                });
                env = env.with_database(database);
            }

            if let Some(url) = &config.env(mode).worker_url {
                let jobs = service.jobs(&JobContext {
                    operation_mode: mode,
                    mailer: mailer.clone(),
                })?;
                let worker = Arc::new(
                    Worker::builder(mode)
                        .with_url(url.clone())
                        .with_debug(config.mode.is_debug())
                        .with_registry(jobs)
                        .build()
                        .await?,
                );
                let closing = worker.clone();
                cleanup.push(format!("{mode}:worker"), move || async move {
                    closing.close().await;
                });
                env = env.with_worker(worker);
            }

            environments.push(env);
        }
        let test = environments
            .pop()
            .ok_or_else(|| Error::configuration("test environment missing"))?;
        let live = environments
            .pop()
            .ok_or_else(|| Error::configuration("live environment missing"))?;

        info!(
            service = service.name(),
            mode = %config.mode,
            databases = live.databases.len(),
            "container ready"
        );

        Ok(Self {
            service: service.name().to_string(),
            config,
            live,
            test,
            mailer,
            bundle,
            storage,
            cleanup,
        })
    }

    /// Assemble from prebuilt parts; used by tests and embedders.
    #[must_use]
    pub fn from_parts(config: Config, live: Environment, test: Environment) -> Self {
        Self {
            service: config.app_service.clone(),
            config,
            live,
            test,
            mailer: None,
            bundle: Arc::new(Bundle::empty(DEFAULT_LANGUAGE)),
            storage: None,
            cleanup: Arc::new(CleanupStack::new()),
        }
    }

    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn ObjectStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The environment selected by the request's operation mode.
    #[must_use]
    pub fn env(&self, ctx: &RequestContext) -> &Environment {
        self.env_for(ctx.operation_mode())
    }

    #[must_use]
    pub fn env_for(&self, mode: OperationMode) -> &Environment {
        match mode {
            OperationMode::Live => &self.live,
            OperationMode::Test => &self.test,
        }
    }

    #[must_use]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        [&self.live, &self.test]
            .into_iter()
            .filter_map(|env| env.worker.clone())
            .collect()
    }

    #[must_use]
    pub fn mailer(&self) -> Option<&Arc<Mailer>> {
        self.mailer.as_ref()
    }

    #[must_use]
    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    #[must_use]
    pub fn storage(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.storage.as_ref()
    }

    /// Run the cleanup stack (databases, workers, then whatever the caller registered
    /// before building, such as the tracer).
    pub async fn shutdown(&self) {
        self.cleanup.run().await;
        info!(service = %self.service, "container shut down");
    }
}

fn mail_transport(config: &Config) -> Result<Arc<dyn MailTransport>> {
    match &config.smtp_url {
        Some(url) => Ok(Arc::new(SmtpTransport::from_url(url)?)),
        None => {
            if !config.mode.is_debug() {
                warn!("SMTP_URL is not set, emails will only be logged");
            }
            Ok(Arc::new(LogTransport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cleanup_runs_in_reverse_order_once() {
        let stack = CleanupStack::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["tracer", "db", "worker"] {
            let order = order.clone();
            stack.push(name, move || async move {
                order
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(name);
            });
        }
        assert_eq!(stack.names(), vec!["tracer", "db", "worker"]);

        stack.run().await;
        stack.run().await;
        assert!(stack.is_empty());
        let order = order.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(order, vec!["worker", "db", "tracer"]);
    }

    #[tokio::test]
    async fn cleanup_pushed_while_running_still_runs() {
        let stack = Arc::new(CleanupStack::new());
        let count = Arc::new(AtomicUsize::new(0));
        let inner_stack = stack.clone();
        let inner_count = count.clone();
        stack.push("outer", move || async move {
            let count = inner_count.clone();
            inner_stack.push("late", move || async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
            inner_count.fetch_add(1, Ordering::SeqCst);
        });
        stack.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn env_is_selected_per_request() -> Result<()> {
        let config = Config::parse_from(Mode::Debug, ["keel"])?;
        let container = Container::from_parts(
            config,
            Environment::new(OperationMode::Live),
            Environment::new(OperationMode::Test),
        );
        let live = RequestContext::new(OperationMode::Live);
        assert_eq!(container.env(&live).operation_mode(), OperationMode::Live);
        assert_eq!(
            container.env(&RequestContext::default()).operation_mode(),
            OperationMode::Test
        );
        assert!(container.workers().is_empty());

        let missing = container.env(&live).database("primary").err();
        assert_eq!(missing.map(|e| e.kind()), Some(crate::ErrorKind::NotFound));
        Ok(())
    }
}

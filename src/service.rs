//! The contract a business service implements to run on keel, and the built-in
//! `platform` service that the `keel` binary serves.

use crate::{
    api::{handlers::health, openapi::Api},
    database::{DatabaseSpec, EMBEDDED_MIGRATIONS, Seeder},
    error::{Error, Result},
    fs::{EmbeddedFs, SharedFs, SubFs},
    mailer::{EmailMessage, Mailer},
    mode::OperationMode,
    worker::{Job, JobHandler, JobRegistry, Worker},
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use include_dir::{Dir, include_dir};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::{path::PathBuf, sync::Arc};
use tonic::service::Routes;
use utoipa_axum::routes;

static ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/assets");

pub const PRIMARY_DATABASE: &str = "primary";
pub const SEND_EMAIL_JOB: &str = "send_email";

/// What job handlers may depend on when a worker is built.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub operation_mode: OperationMode,
    pub mailer: Option<Arc<Mailer>>,
}

pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Databases built for both operation modes; URLs come from the environment.
    fn databases(&self) -> Vec<DatabaseSpec>;

    /// Documented HTTP surfaces, one OpenAPI document each.
    fn apis(&self) -> Vec<Api>;

    fn grpc_routes(&self) -> Option<Routes> {
        None
    }

    /// Handlers for the worker of `ctx.operation_mode`.
    fn jobs(&self, _ctx: &JobContext) -> Result<JobRegistry> {
        Ok(JobRegistry::new())
    }

    /// `templates/` and `layouts/` for the mailer; no mailer is built without them.
    fn mail_templates(&self) -> Option<SharedFs> {
        None
    }

    /// A source holding `locales/<lang>.json`.
    fn locales(&self) -> Option<SharedFs> {
        None
    }
}

/// Probes, gRPC health, the `keel_metadata` schema and an email job.
#[derive(Clone, Debug, Default)]
pub struct PlatformService;

impl Service for PlatformService {
    fn name(&self) -> &str {
        "platform"
    }

    fn databases(&self) -> Vec<DatabaseSpec> {
        let seeder: Seeder = Arc::new(seed_metadata);
        vec![
            DatabaseSpec::new(PRIMARY_DATABASE, Arc::new(EmbeddedFs::new(&EMBEDDED_MIGRATIONS)))
                .with_seeder(seeder)
                .with_source_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")),
        ]
    }

    fn apis(&self) -> Vec<Api> {
        let mut api = Api::new("platform").with_description("Platform health and metadata");
        api.router = api.router.routes(routes!(health::health));
        vec![api]
    }

    fn grpc_routes(&self) -> Option<Routes> {
        // The overall ("") service starts out SERVING.
        let (_reporter, health_service) = tonic_health::server::health_reporter();
        Some(Routes::new(health_service))
    }

    fn jobs(&self, ctx: &JobContext) -> Result<JobRegistry> {
        let mut registry = JobRegistry::new();
        if let Some(mailer) = &ctx.mailer {
            registry.register(Arc::new(SendEmail {
                mailer: mailer.clone(),
            }))?;
        }
        Ok(registry)
    }

    fn mail_templates(&self) -> Option<SharedFs> {
        SubFs::new(Arc::new(EmbeddedFs::new(&ASSETS)), "mail")
            .ok()
            .map(|fs| Arc::new(fs) as SharedFs)
    }

    fn locales(&self) -> Option<SharedFs> {
        Some(Arc::new(EmbeddedFs::new(&ASSETS)))
    }
}

fn seed_metadata<'c>(conn: &'c mut PgConnection) -> BoxFuture<'c, Result<()>> {
    Box::pin(async move {
        for (key, value) in [
            ("seeded_by", crate::APP_USER_AGENT),
            ("seeded_commit", crate::GIT_COMMIT_HASH),
        ] {
            sqlx::query(
                "INSERT INTO keel_metadata (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    })
}

/// Arguments of a [`SEND_EMAIL_JOB`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendEmailArgs {
    pub to: Vec<String>,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl SendEmailArgs {
    fn message(&self) -> Result<EmailMessage> {
        let mut recipients = self.to.iter();
        let first = recipients
            .next()
            .ok_or_else(|| Error::validation("send_email: no recipients"))?;
        let mut message = EmailMessage::new(first, &self.subject, &self.template);
        for to in recipients {
            message = message.with_recipient(to);
        }
        if !self.data.is_null() {
            message = message.with_data(self.data.clone());
        }
        if let Some(locale) = &self.locale {
            message = message.with_locale(locale);
        }
        Ok(message)
    }
}

/// Queue an email on `worker`, inside the caller's transaction when one is given.
pub async fn enqueue_email(
    worker: &Worker,
    conn: Option<&mut PgConnection>,
    args: &SendEmailArgs,
) -> Result<uuid::Uuid> {
    args.message()?;
    worker.enqueue(conn, SEND_EMAIL_JOB, args).await
}

struct SendEmail {
    mailer: Arc<Mailer>,
}

#[async_trait]
impl JobHandler for SendEmail {
    fn kind(&self) -> &str {
        SEND_EMAIL_JOB
    }

    async fn work(&self, job: &Job) -> Result<()> {
        let args: SendEmailArgs = job.args()?;
        self.mailer.send(&args.message()?).await?;
        Ok(())
    }
}

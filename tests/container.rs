mod common;

use anyhow::Result;
use axum::{body::Body, http::Request, http::StatusCode};
use keel::{
    Container, Mode, OperationMode, RequestContext,
    api::{self, HttpOptions},
    config::Config,
    container::CleanupStack,
    service::{PRIMARY_DATABASE, PlatformService, SendEmailArgs, Service, enqueue_email},
};
use sqlx::Row;
use std::sync::Arc;
use tower::ServiceExt;

#[tokio::test]
async fn live_and_test_are_isolated() -> Result<()> {
    let Some(pg) = common::postgres().await? else {
        return Ok(());
    };
    let config = Config::parse_from(Mode::Debug, ["keel"])?.with_environment_vars([
        ("LIVE_PRIMARY_WRITER_DB_URL", pg.create_database("live").await?),
        ("TEST_PRIMARY_WRITER_DB_URL", pg.create_database("test").await?),
        ("LIVE_WORKER_DB_URL", pg.create_database("live_queue").await?),
        ("TEST_WORKER_DB_URL", pg.create_database("test_queue").await?),
    ]);

    let cleanup = Arc::new(CleanupStack::new());
    let container = Arc::new(Container::build(config, &PlatformService, cleanup.clone()).await?);
    assert_eq!(container.workers().len(), 2);
    assert!(container.mailer().is_some());

    for mode in OperationMode::ALL {
        container.env_for(mode).migrate().await?;
    }

    let live = RequestContext::new(OperationMode::Live);
    container
        .env(&live)
        .database(PRIMARY_DATABASE)?
        .with_tx(|conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO keel_metadata (key, value) VALUES ('region', 'eu')")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .await?;

    let count = |mode| {
        let container = container.clone();
        async move {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM keel_metadata")
                .fetch_one(container.env_for(mode).database(PRIMARY_DATABASE)?.reader())
                .await?;
            anyhow::Ok(row.try_get::<i64, _>("n")?)
        }
    };
    assert_eq!(count(OperationMode::Live).await?, 1);
    assert_eq!(count(OperationMode::Test).await?, 0);

    // jobs land on the queue of the request's mode only
    let test_worker = container
        .env_for(OperationMode::Test)
        .worker()
        .ok_or_else(|| anyhow::anyhow!("test worker"))?
        .clone();
    enqueue_email(
        &test_worker,
        None,
        &SendEmailArgs {
            to: vec!["ops@example.com".to_string()],
            subject: "Welcome".to_string(),
            template: "welcome".to_string(),
            data: serde_json::json!({"name": "Ada", "app": "Keel"}),
            locale: None,
        },
    )
    .await?;
    assert_eq!(test_worker.work_once().await?, 1);
    let live_worker = container
        .env_for(OperationMode::Live)
        .worker()
        .ok_or_else(|| anyhow::anyhow!("live worker"))?
        .clone();
    assert_eq!(live_worker.work_once().await?, 0);

    let app = api::app(container.clone(), PlatformService.apis(), HttpOptions::default());
    let response = app
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    container.shutdown().await;
    assert!(cleanup.is_empty());
    assert!(
        container
            .env_for(OperationMode::Live)
            .database(PRIMARY_DATABASE)?
            .is_closed()
    );
    Ok(())
}

//! `/health`: checks the live and test environments (every database writer and
//! reader, plus the job queue database) and reports each one.

use crate::{Container, GIT_COMMIT_HASH, container::Environment};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, warn};
use utoipa::ToSchema;

const HEALTH_DB_TIMEOUT_SECONDS: u64 = 2;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    live: String,
    test: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Live and test databases are healthy", body = Health),
        (status = 503, description = "At least one database is unhealthy", body = Health)
    ),
    tag = "health",
)]
/// Health check for both operation modes. `OPTIONS` returns the same status and
/// `X-App` header with an empty body.
pub async fn health(method: Method, container: Extension<Arc<Container>>) -> impl IntoResponse {
    let (live, test) = tokio::join!(
        check_env(container.env_for(crate::OperationMode::Live)),
        check_env(container.env_for(crate::OperationMode::Test)),
    );

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live: status_label(live),
        test: status_label(test),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let headers = x_app_header(&health.name, &health.version, &health.commit)
        .map(|value| {
            let mut headers = HeaderMap::new();
            headers.insert("X-App", value);
            headers
        })
        .unwrap_or_default();

    if live && test {
        (StatusCode::OK, headers, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

fn status_label(healthy: bool) -> String {
    if healthy { "ok" } else { "error" }.to_string()
}

/// `name:version:short-commit`, the short commit empty when unknown.
fn x_app_header(name: &str, version: &str, commit: &str) -> Option<HeaderValue> {
    let short_hash = if commit.len() > 7 { &commit[0..7] } else { "" };

    format!("{name}:{version}:{short_hash}")
        .parse::<HeaderValue>()
        .map_err(|err| {
            debug!("Failed to parse X-App header: {}", err);
        })
        .ok()
}

async fn check_env(env: &Environment) -> bool {
    let mode = env.operation_mode();
    match timeout(
        Duration::from_secs(HEALTH_DB_TIMEOUT_SECONDS),
        env.health_check(),
    )
    .await
    {
        Ok(Ok(())) => {
            debug!(%mode, "databases are healthy");
            true
        }
        Ok(Err(err)) => {
            error!(%mode, "database health check failed: {}", err);
            false
        }
        Err(_) => {
            warn!(%mode, "database health check timed out");
            false
        }
    }
}

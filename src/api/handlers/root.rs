use axum::{http::StatusCode, response::IntoResponse};

// axum handler for "/"
pub async fn root() -> impl IntoResponse {
    (
        StatusCode::OK,
        format!("{} {}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    )
}

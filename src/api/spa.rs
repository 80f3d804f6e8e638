//! Single-page app tree served as the router fallback.
//!
//! `/` serves `index.html`, an extension-less path `P` serves `P.html`, and a miss on
//! such a path serves `404.html` with status 404. Paths with an extension are served
//! as-is with a content type guessed from the extension.

use crate::fs::SharedFs;
use axum::{
    Router,
    extract::State,
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::path::Path;
use tracing::debug;

const INDEX: &str = "index.html";
const NOT_FOUND: &str = "404.html";

pub fn router(fs: SharedFs) -> Router {
    Router::new().fallback(serve).with_state(fs)
}

async fn serve(State(fs): State<SharedFs>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let path = uri.path().trim_start_matches('/');
    let (file, missing_page) = resolve(path);

    match fs.read(&file) {
        Ok(bytes) => file_response(StatusCode::OK, &file, bytes),
        Err(err) => {
            debug!(path = %uri.path(), file = %file, "spa miss: {err}");
            match missing_page.then(|| fs.read(NOT_FOUND).ok()).flatten() {
                Some(bytes) => file_response(StatusCode::NOT_FOUND, NOT_FOUND, bytes),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
    }
}

/// The file backing `path` and whether a miss renders `404.html`.
fn resolve(path: &str) -> (String, bool) {
    if path.is_empty() {
        return (INDEX.to_string(), true);
    }
    if let Some(dir) = path.strip_suffix('/') {
        return (format!("{dir}/{INDEX}"), true);
    }
    if Path::new(path).extension().is_some() {
        (path.to_string(), false)
    } else {
        (format!("{path}.html"), true)
    }
}

fn file_response(status: StatusCode, file: &str, bytes: Vec<u8>) -> Response {
    let mime = mime_guess::from_path(file).first_or_octet_stream();
    (status, [(header::CONTENT_TYPE, mime.as_ref().to_string())], bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn site() -> anyhow::Result<(tempfile::TempDir, Router)> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>")?;
        std::fs::write(dir.path().join("pricing.html"), "<h1>pricing</h1>")?;
        std::fs::write(dir.path().join("404.html"), "<h1>lost</h1>")?;
        std::fs::create_dir_all(dir.path().join("assets"))?;
        std::fs::write(dir.path().join("assets/app.js"), "console.log(1)")?;
        let fs: SharedFs = Arc::new(LocalFs::new(dir.path()));
        Ok((dir, router(fs)))
    }

    async fn get(app: &Router, path: &str) -> anyhow::Result<(StatusCode, String, String)> {
        let response = app
            .clone()
            .oneshot(Request::get(path).body(Body::empty())?)
            .await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, content_type, String::from_utf8(body.to_vec())?))
    }

    #[test]
    fn resolves_paths() {
        assert_eq!(resolve(""), ("index.html".to_string(), true));
        assert_eq!(resolve("pricing"), ("pricing.html".to_string(), true));
        assert_eq!(resolve("docs/"), ("docs/index.html".to_string(), true));
        assert_eq!(resolve("assets/app.js"), ("assets/app.js".to_string(), false));
    }

    #[tokio::test]
    async fn serves_pages_and_assets() -> anyhow::Result<()> {
        let (_dir, app) = site()?;

        let (status, content_type, body) = get(&app, "/").await?;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/html"));
        assert_eq!(body, "<h1>home</h1>");

        let (status, _, body) = get(&app, "/pricing").await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>pricing</h1>");

        let (status, content_type, _) = get(&app, "/assets/app.js").await?;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.contains("javascript"));
        Ok(())
    }

    #[tokio::test]
    async fn misses_render_not_found_page() -> anyhow::Result<()> {
        let (_dir, app) = site()?;

        let (status, _, body) = get(&app, "/missing").await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "<h1>lost</h1>");

        let (status, _, body) = get(&app, "/missing.css").await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
        Ok(())
    }
}

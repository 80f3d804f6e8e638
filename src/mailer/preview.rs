//! Template preview routes, mounted in debug mode only.
//!
//! - `GET /mailer/preview` redirects to the first template.
//! - `GET /mailer/preview/{template}?format=html|text&locale=..` renders one part, or a
//!   page with both parts and a test-send form when `format` is absent.
//! - `POST /mailer/preview/{template}/send` sends the sample to `email` (JSON or form).

use super::{EmailMessage, Mailer, Rendered};
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    extract::{FromRequest, Path, Query, Request, State},
    http::header,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PREVIEW_PATH: &str = "/mailer/preview";

const PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>{{ template }} · mail preview</title>
<style>
body{font-family:system-ui,sans-serif;margin:0;display:flex;height:100vh}
nav{width:14rem;border-right:1px solid #ddd;padding:1rem;overflow:auto}
nav a{display:block;padding:.25rem 0}nav a.active{font-weight:bold}
main{flex:1;display:flex;flex-direction:column;padding:1rem;gap:1rem}
iframe{flex:1;border:1px solid #ddd;width:100%}pre{background:#f6f6f6;padding:1rem;white-space:pre-wrap}
</style></head>
<body>
<nav>{% for name in templates %}<a href="{{ base }}/{{ name }}{% if locale %}?locale={{ locale }}{% endif %}"{% if name == template %} class="active"{% endif %}>{{ name }}</a>{% endfor %}</nav>
<main>
<form method="post" action="{{ base }}/{{ template }}/send{% if locale %}?locale={{ locale }}{% endif %}">
<input type="email" name="email" placeholder="send to" required> <button type="submit">Send</button>
</form>
<iframe srcdoc="{{ html }}"></iframe>
<pre>{{ text }}</pre>
</main>
</body>
</html>"#;

/// What the preview routes need from a mailer.
#[async_trait]
pub trait PreviewMailer: Send + Sync {
    fn templates(&self) -> Result<Vec<String>>;

    /// Render `template` with its sample data.
    fn preview(&self, template: &str, locale: Option<&str>) -> Result<Rendered>;

    /// Send the sample rendering of `template`; returns the message id.
    async fn send_preview(&self, template: &str, to: &str, locale: Option<&str>) -> Result<String>;
}

#[async_trait]
impl PreviewMailer for Mailer {
    fn templates(&self) -> Result<Vec<String>> {
        self.renderer().templates()
    }

    fn preview(&self, template: &str, locale: Option<&str>) -> Result<Rendered> {
        let message = self.preview_message(template, "preview@localhost", locale)?;
        let email = self.render(&message)?;
        Ok(Rendered {
            html: email.html,
            text: email.text,
        })
    }

    async fn send_preview(&self, template: &str, to: &str, locale: Option<&str>) -> Result<String> {
        let message = self.preview_message(template, to, locale)?;
        self.send(&message).await
    }
}

impl Mailer {
    fn preview_message(&self, template: &str, to: &str, locale: Option<&str>) -> Result<EmailMessage> {
        if !self.renderer().has_template(template) {
            return Err(Error::not_found(format!("mail template {template}")));
        }
        let mut message = EmailMessage::new(to, format!("[preview] {template}"), template)
            .with_data(self.renderer().sample_data(template)?);
        if let Some(locale) = locale {
            message = message.with_locale(locale);
        }
        Ok(message)
    }
}

type Shared = Arc<dyn PreviewMailer>;

pub fn router(mailer: Shared) -> Router {
    Router::new()
        .route(PREVIEW_PATH, get(index))
        .route(&format!("{PREVIEW_PATH}/{{template}}"), get(show))
        .route(&format!("{PREVIEW_PATH}/{{template}}/send"), post(send))
        .with_state(mailer)
}

#[derive(Debug, Default, Deserialize)]
pub struct PreviewQuery {
    format: Option<String>,
    locale: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendPreview {
    email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SentPreview {
    pub message_id: String,
}

async fn index(State(mailer): State<Shared>) -> Result<Redirect> {
    let templates = mailer.templates()?;
    let first = templates
        .first()
        .ok_or_else(|| Error::not_found("no mail templates"))?;
    Ok(Redirect::to(&format!("{PREVIEW_PATH}/{first}")))
}

async fn show(
    State(mailer): State<Shared>,
    Path(template): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Response> {
    let locale = query.locale.as_deref().filter(|locale| !locale.is_empty());
    let rendered = mailer.preview(&template, locale)?;

    match query.format.as_deref() {
        Some("html") => Ok(Html(rendered.html).into_response()),
        Some("text") => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            rendered.text,
        )
            .into_response()),
        None | Some("") => {
            let templates = mailer.templates()?;
            Ok(Html(page(&template, &templates, locale, &rendered)?).into_response())
        }
        Some(other) => Err(Error::validation(format!("unknown preview format: {other}"))),
    }
}

async fn send(
    State(mailer): State<Shared>,
    Path(template): Path<String>,
    Query(query): Query<PreviewQuery>,
    request: Request,
) -> Result<Json<SentPreview>> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    let body = if is_json {
        Json::<SendPreview>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .map_err(|err| Error::validation(err.body_text()))?
    } else {
        Form::<SendPreview>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .map_err(|err| Error::validation(err.body_text()))?
    };

    let to = body.email.trim();
    if to.is_empty() {
        return Err(Error::validation("email is required"));
    }
    let locale = query.locale.as_deref().filter(|locale| !locale.is_empty());
    let message_id = mailer.send_preview(&template, to, locale).await?;
    Ok(Json(SentPreview { message_id }))
}

fn page(template: &str, templates: &[String], locale: Option<&str>, rendered: &Rendered) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("preview.html", PAGE)?;
    let html = env.get_template("preview.html")?.render(context! {
        base => PREVIEW_PATH,
        template => template,
        templates => templates,
        locale => locale,
        html => rendered.html,
        text => rendered.text,
    })?;
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::{
        MailerConfig,
        tests::{RecordingTransport, templates},
    };
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Result<(tempfile::TempDir, Arc<RecordingTransport>, Router)> {
        let (dir, fs) = templates()?;
        let transport = Arc::new(RecordingTransport::default());
        let mailer = Mailer::new(MailerConfig::new("no-reply@keel.dev"), fs, transport.clone());
        Ok((dir, transport, router(Arc::new(mailer))))
    }

    async fn body_string(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn index_redirects_to_first_template() -> Result<()> {
        let (_dir, _transport, app) = app()?;
        let response = app
            .oneshot(HttpRequest::get("/mailer/preview").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/mailer/preview/welcome"
        );
        Ok(())
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn renders_parts_with_sample_data() -> Result<()> {
        let (_dir, _transport, app) = app()?;

        let html = app
            .clone()
            .oneshot(
                HttpRequest::get("/mailer/preview/welcome?format=html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(html.status(), StatusCode::OK);
        assert_eq!(body_string(html).await, "<main><p>Hi Preview</p></main>");

        let text = app
            .clone()
            .oneshot(
                HttpRequest::get("/mailer/preview/welcome?format=text")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(text).await, "Hi Preview");

        let page = app
            .clone()
            .oneshot(HttpRequest::get("/mailer/preview/welcome").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let page = body_string(page).await;
        assert!(page.contains("srcdoc=\"&lt;main&gt;"));
        assert!(page.contains("<pre>Hi Preview</pre>"));

        let missing = app
            .oneshot(HttpRequest::get("/mailer/preview/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn sends_from_json_and_form() -> Result<()> {
        let (_dir, transport, app) = app()?;

        let json = app
            .clone()
            .oneshot(
                HttpRequest::post("/mailer/preview/welcome/send")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"email":"dev@keel.dev"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json.status(), StatusCode::OK);

        let form = app
            .clone()
            .oneshot(
                HttpRequest::post("/mailer/preview/welcome/send")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("email=ops%40keel.dev"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(form.status(), StatusCode::OK);

        let empty = app
            .oneshot(
                HttpRequest::post("/mailer/preview/welcome/send")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"email":" "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let batches = transport.batches.lock().map(|b| b.clone()).unwrap_or_default();
        let recipients: Vec<String> = batches.iter().map(|b| b[0].to[0].clone()).collect();
        assert_eq!(recipients, vec!["dev@keel.dev".to_string(), "ops@keel.dev".to_string()]);
        Ok(())
    }
}

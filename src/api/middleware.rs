use crate::{
    context::{DEBUG_HEADER, ModeResolver, REQUEST_ID_HEADER, RequestContext},
    logger::HeaderBlock,
    mode::Mode,
};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::info;

/// Resolve the operation mode and store the [`RequestContext`] in the extensions.
pub async fn operation_mode(
    State(resolver): State<Arc<ModeResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::new(resolver.resolve(request.headers()));
    if let Some(request_id) = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        ctx = ctx.with_request_id(request_id);
    }
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

/// Honour `X-Debug: 1|true`, only when the process runs in debug mode.
pub async fn debug(State(mode): State<Mode>, mut request: Request, next: Next) -> Response {
    if mode.is_debug() && debug_requested(&request) {
        let ctx = RequestContext::from_extensions(request.extensions()).with_debug(true);
        request.extensions_mut().insert(ctx);
    }
    next.run(request).await
}

fn debug_requested(request: &Request) -> bool {
    request
        .headers()
        .get(DEBUG_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

/// One `log.kind = "http"` record per request; headers only for debug requests.
pub async fn log_request(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let headers = RequestContext::from_extensions(request.extensions())
        .debug()
        .then(|| HeaderBlock(request.headers()).to_string())
        .unwrap_or_default();

    let response = next.run(request).await;

    info!(
        log.kind = "http",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency = ?start.elapsed(),
        client_ip = %client_ip,
        headers = %headers,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::OperationMode;
    use axum::{
        Router,
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware::{from_fn, from_fn_with_state},
        routing::get,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn describe(ctx: RequestContext) -> String {
        format!(
            "{}:{}:{}",
            ctx.operation_mode(),
            ctx.debug(),
            ctx.request_id().unwrap_or("-")
        )
    }

    fn app(mode: Mode) -> Router {
        Router::new()
            .route("/", get(describe))
            .layer(from_fn(log_request))
            .layer(from_fn_with_state(mode, debug))
            .layer(from_fn_with_state(
                Arc::new(ModeResolver::new(["https://dashboard.example.com"])),
                operation_mode,
            ))
    }

    async fn call(app: Router, request: HttpRequest<Body>) -> anyhow::Result<String> {
        let response = app.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    #[tokio::test]
    async fn requests_default_to_test() -> anyhow::Result<()> {
        let body = call(app(Mode::Debug), HttpRequest::get("/").body(Body::empty())?).await?;
        assert_eq!(body, "test:false:-");
        Ok(())
    }

    #[tokio::test]
    async fn live_key_and_request_id_reach_the_context() -> anyhow::Result<()> {
        let request = HttpRequest::get("/")
            .header("authorization", "Bearer sk_live_abc")
            .header("x-request-id", "01J0000000000000000000000")
            .body(Body::empty())?;
        let body = call(app(Mode::Release), request).await?;
        assert_eq!(body, format!("{}:false:01J0000000000000000000000", OperationMode::Live));
        Ok(())
    }

    #[tokio::test]
    async fn debug_header_only_in_debug_mode() -> anyhow::Result<()> {
        let request = || HttpRequest::get("/").header("x-debug", "true").body(Body::empty());
        assert_eq!(call(app(Mode::Debug), request()?).await?, "test:true:-");
        assert_eq!(call(app(Mode::Release), request()?).await?, "test:false:-");

        let one = HttpRequest::get("/").header("x-debug", "1").body(Body::empty())?;
        assert_eq!(call(app(Mode::Debug), one).await?, "test:true:-");
        let no = HttpRequest::get("/").header("x-debug", "yes").body(Body::empty())?;
        assert_eq!(call(app(Mode::Debug), no).await?, "test:false:-");
        Ok(())
    }
}

//! Tower layers wrapped around every gRPC route.

use crate::context::{OPERATION_MODE_METADATA, REQUEST_ID_HEADER, RequestContext};
use crate::{error::panic_message, mode::OperationMode};
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Request, Response, header::CONTENT_TYPE};
use percent_encoding::percent_decode_str;
use std::{
    any::Any,
    fmt,
    task::{Context, Poll},
    time::Instant,
};
use tonic::Code;
use tower::{Layer, Service};
use tracing::{Span, error, info, info_span, warn};

/// Reads `x-operation-mode` metadata into a [`RequestContext`] extension.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModeLayer;

impl<S> Layer<S> for ModeLayer {
    type Service = ModeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ModeService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct ModeService<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for ModeService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let headers = request.headers();
        let mut ctx = RequestContext::new(OperationMode::from_signal(header_str(
            headers,
            OPERATION_MODE_METADATA,
        )));
        if let Some(request_id) = header_str(headers, REQUEST_ID_HEADER) {
            ctx = ctx.with_request_id(request_id);
        }
        request.extensions_mut().insert(ctx);
        self.inner.call(request)
    }
}

/// One `log.kind = "grpc"` record per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggerLayer;

impl<S> Layer<S> for LoggerLayer {
    type Service = LoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggerService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerService<S> {
    inner: S,
}

impl<S, B, ResBody> Service<Request<B>> for LoggerService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let start = Instant::now();
        let (service, method) = split_path(request.uri().path());
        let future = self.inner.call(request);

        Box::pin(async move {
            let result = future.await;
            let latency = start.elapsed();
            let (code, message) = match &result {
                Ok(response) => status(response.headers()),
                Err(err) => (Code::Unknown, err.to_string()),
            };
            if code == Code::Ok {
                info!(
                    log.kind = "grpc",
                    rpc.service = %service,
                    rpc.method = %method,
                    rpc.code = ?code,
                    latency = ?latency,
                    "rpc"
                );
            } else {
                warn!(
                    log.kind = "grpc",
                    rpc.service = %service,
                    rpc.method = %method,
                    rpc.code = ?code,
                    latency = ?latency,
                    rpc.message = %message,
                    "rpc"
                );
            }
            result
        })
    }
}

/// `/pkg.Service/Method` into its service and method.
fn split_path(path: &str) -> (String, String) {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let service = parts.next().unwrap_or_default().to_string();
    let method = parts.next().unwrap_or_default().to_string();
    (service, method)
}

/// Status carried in the headers of a trailers-only response; streamed responses
/// report theirs in trailers and count as `Ok` here.
fn status(headers: &HeaderMap) -> (Code, String) {
    let code = headers
        .get("grpc-status")
        .map_or(Code::Ok, |value| Code::from_bytes(value.as_bytes()));
    let message = header_str(headers, "grpc-message")
        .map(|value| percent_decode_str(value).decode_utf8_lossy().into_owned())
        .unwrap_or_default();
    (code, message)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Panic response for `CatchPanicLayer`: a trailers-only `Internal` status.
pub fn panic_status(payload: Box<dyn Any + Send + 'static>) -> Response<axum::body::Body> {
    let message = panic_message(payload.as_ref());
    error!(panic = %message, "rpc handler panicked");

    let mut response = Response::new(axum::body::Body::empty());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if tonic::Status::internal("internal error")
        .add_header(response.headers_mut())
        .is_err()
    {
        response
            .headers_mut()
            .insert("grpc-status", HeaderValue::from_static("13"));
    }
    response
}

// span
pub fn grpc_span(request: &Request<tonic::body::Body>) -> Span {
    let (service, method) = split_path(request.uri().path());
    let request_id = header_str(request.headers(), REQUEST_ID_HEADER).unwrap_or("none");

    info_span!(
        "grpc-request",
        otel.kind = "server",
        rpc.system = "grpc",
        rpc.service = %service,
        rpc.method = %method,
        request_id
    )
}

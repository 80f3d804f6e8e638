//! HTTP surface: the router every service is served behind, and its server.

use crate::{
    Container,
    config::Config,
    context::{ModeResolver, REQUEST_ID_HEADER},
    error::{Error, Result, panic_message},
    fs::{LocalFs, SharedFs},
    mailer::preview::{self, PreviewMailer},
    mode::Mode,
};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, options},
};
use std::{
    any::Any,
    future::IntoFuture,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{net::TcpListener, sync::watch, time::timeout};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, error, info, warn};
use ulid::Ulid;

pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod spa;

use handlers::{health, root};
pub use openapi::Api;

/// What the router needs beside the container and the service APIs.
#[derive(Clone, Default)]
pub struct HttpOptions {
    pub mode: Mode,
    pub trusted_origins: Vec<String>,
    pub spa: Option<SharedFs>,
    pub preview: Option<Arc<dyn PreviewMailer>>,
}

impl HttpOptions {
    /// Options from the process configuration; the preview is wired by the caller.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.mode,
            trusted_origins: config.trusted_origins.clone(),
            spa: config
                .spa_dir
                .as_ref()
                .map(|dir| Arc::new(LocalFs::new(dir)) as SharedFs),
            preview: None,
        }
    }

    #[must_use]
    pub fn with_preview(mut self, preview: Arc<dyn PreviewMailer>) -> Self {
        self.preview = Some(preview);
        self
    }
}

/// Build the application router.
///
/// Every API is merged as-is; `OPTIONS /health` is added next to the documented
/// `GET /health`. Without an SPA tree `/` answers with the name and version.
pub fn app(container: Arc<Container>, apis: Vec<Api>, http_options: HttpOptions) -> Router {
    let mut router = Router::new();
    for api in apis {
        let (api_router, _openapi) = api.split();
        router = router.merge(api_router);
    }
    router = router.route("/health", options(health::health));

    if http_options.mode.is_debug()
        && let Some(mailer) = http_options.preview
    {
        info!("mailer preview mounted at {}", preview::PREVIEW_PATH);
        router = router.merge(preview::router(mailer));
    }

    router = match http_options.spa {
        Some(fs) => router.merge(spa::router(fs)),
        None => router.route("/", get(root::root)),
    };

    let resolver = Arc::new(ModeResolver::new(&http_options.trusted_origins));

    router.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static(REQUEST_ID_HEADER),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                REQUEST_ID_HEADER,
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(from_fn_with_state(resolver, middleware::operation_mode))
            .layer(from_fn_with_state(http_options.mode, middleware::debug))
            .layer(from_fn(middleware::log_request))
            .layer(Extension(container)),
    )
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!(
        "http-request",
        method = %request.method(),
        path,
        headers = %crate::logger::HeaderBlock(headers),
        request_id
    )
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_message(payload.as_ref());
    error!(panic = %message, "handler panicked");
    Error::Panic(message).into_response()
}

/// An HTTP server bound at construction so [`HttpServer::addr`] is known before
/// serving (port 0 included).
pub struct HttpServer {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    app: Router,
    shutdown: watch::Sender<bool>,
    force: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl HttpServer {
    /// # Errors
    /// Fails when the address cannot be bound.
    pub async fn bind(addr: SocketAddr, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            addr,
            listener: Mutex::new(Some(listener)),
            app,
            shutdown: watch::Sender::new(false),
            force: watch::Sender::new(false),
            stopped: watch::Sender::new(false),
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until [`HttpServer::shutdown`] is called.
    ///
    /// # Errors
    /// Fails when called twice or when accepting connections fails.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::conflict("http server already started"))?;

        let mut shutdown = self.shutdown.subscribe();
        let mut force = self.force.subscribe();

        info!("Listening on {}", self.addr);

        let serve = axum::serve(
            listener,
            self.app
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Gracefully shutdown");
        })
        .into_future();

        let result = tokio::select! {
            result = serve => result.map_err(Error::from),
            () = async { let _ = force.wait_for(|force| *force).await; } => Ok(()),
        };

        self.stopped.send_replace(true);
        result
    }

    /// Stop accepting, then wait for in-flight requests until `deadline`. Past the
    /// deadline the server stops waiting and the call reports a timeout.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] when requests were still running at the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.shutdown.send_replace(true);

        let never_started = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_started {
            self.stopped.send_replace(true);
            return Ok(());
        }

        let mut stopped = self.stopped.subscribe();
        if timeout(deadline, stopped.wait_for(|stopped| *stopped))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(?deadline, "http shutdown deadline exceeded, closing connections");
        self.force.send_replace(true);
        Err(Error::Timeout(deadline))
    }
}

//! gRPC server for a service's tonic routes.
//!
//! Every call passes, outermost first, through: the mode extractor, the logger,
//! panic recovery (`Internal`) and an OpenTelemetry span.

mod layers;

pub use layers::{LoggerLayer, ModeLayer, grpc_span, panic_status};

use crate::error::{Error, Result};
use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::{net::TcpListener, sync::watch, time::timeout};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{service::Routes, transport::Server};
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

pub struct GrpcServer {
    addr: SocketAddr,
    state: Mutex<Option<(TcpListener, Routes)>>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl GrpcServer {
    /// Bind `addr` now so the resolved address is known before serving.
    ///
    /// # Errors
    /// Fails when the address cannot be bound.
    pub async fn bind(addr: SocketAddr, routes: Routes) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            addr,
            state: Mutex::new(Some((listener, routes))),
            shutdown: watch::Sender::new(false),
            stopped: watch::Sender::new(false),
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until [`GrpcServer::stop`].
    ///
    /// # Errors
    /// Fails when called twice or when the transport fails.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let (listener, routes) = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::conflict("grpc server already started"))?;

        let mut shutdown = self.shutdown.subscribe();

        info!("gRPC listening on {}", self.addr);

        let result = Server::builder()
            .layer(
                ServiceBuilder::new()
                    .layer(ModeLayer)
                    .layer(LoggerLayer)
                    .layer(CatchPanicLayer::custom(panic_status))
                    .layer(TraceLayer::new_for_grpc().make_span_with(grpc_span)),
            )
            .add_routes(routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                info!("gRPC gracefully shutdown");
            })
            .await
            .map_err(|err| Error::transient(format!("grpc server: {err}")));

        self.stopped.send_replace(true);
        result
    }

    /// Stop accepting calls and wait for in-flight ones until `deadline`.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] when calls were still running at the deadline.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.shutdown.send_replace(true);

        let never_started = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_started {
            return Ok(());
        }

        let mut stopped = self.stopped.subscribe();
        if timeout(deadline, stopped.wait_for(|stopped| *stopped))
            .await
            .is_ok()
        {
            return Ok(());
        }
        warn!(?deadline, "gRPC stop deadline exceeded");
        Err(Error::Timeout(deadline))
    }
}

//! Binding a [`Service`] to real sockets.
//!
//! [`serve`] adapts a service to hyper and runs an accept loop over an
//! existing listener; [`listen`] also resolves the bind address. Each
//! connection is served by hyper's auto builder, so HTTP/1.1 and
//! prior-knowledge h2c both work out of the box, and upgrades (h2c
//! handshake, hijacking) are enabled.
//!
//! Shutdown is graceful: [`Server::stop`] stops accepting, then drains
//! in-flight connections for the stop window before giving up at the kill
//! window.

use std::convert::Infallible;
use std::env;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::CONTENT_LENGTH;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};

use crate::body::Body;
use crate::context::Context;
use crate::request::Request;
use crate::response::Response;
use crate::service::{ArcService, Service, ServiceExt};

/// How long [`Server::stop`] waits for in-flight connections to drain.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(20);
/// Hard upper bound on shutdown, after which remaining work is abandoned.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// A handle to a running server.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server's base URL, handy for pointing clients at it.
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Resolves once the accept loop has fully wound down.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.finished.clone().cancelled_owned()
    }

    /// Stops accepting and drains in-flight connections, waiting at most the
    /// default kill window.
    pub async fn stop(&self) {
        self.stop_with(DEFAULT_KILL_TIMEOUT).await;
    }

    /// [`stop`](Server::stop) with a custom kill window.
    pub async fn stop_with(&self, kill_timeout: Duration) {
        self.shutdown.cancel();
        tokio::select! {
            () = self.finished.clone().cancelled_owned() => {}
            () = tokio::time::sleep(kill_timeout) => {
                warn!("kill timeout elapsed before shutdown completed");
            }
        }
    }
}

/// Binds `svc` to an address resolved from, in order: the explicit
/// argument, `LISTEN_ADDR`, `PORT` (all interfaces), or an ephemeral
/// loopback port.
pub async fn listen(svc: impl Service, addr: Option<&str>) -> Result<Server, ServerError> {
    let addr = resolve_addr(addr);
    let listener = TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind { addr, source })?;
    serve(svc, listener).await
}

/// Serves `svc` on an existing listener with graceful shutdown.
pub async fn serve(svc: impl Service, listener: TcpListener) -> Result<Server, ServerError> {
    serve_arc(svc.into_arc(), listener).await
}

async fn serve_arc(svc: ArcService, listener: TcpListener) -> Result<Server, ServerError> {
    let local_addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let finished = CancellationToken::new();

    let loop_shutdown = shutdown.clone();
    let loop_finished = finished.clone();
    tokio::spawn(async move {
        accept_loop(svc, listener, loop_shutdown).await;
        loop_finished.cancel();
    });

    info!(addr = %local_addr, "server listening");
    Ok(Server { local_addr, shutdown, finished })
}

async fn accept_loop(svc: ArcService, listener: TcpListener, shutdown: CancellationToken) {
    let graceful = GracefulShutdown::new();
    let ctx = Context::background();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _remote_addr) = match accepted {
                    Ok(stream_and_addr) => stream_and_addr,
                    Err(e) => {
                        warn!(cause = %e, "failed to accept");
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let conn_ctx = ctx.child();
                let adapter = HyperAdapter::new(Arc::clone(&svc), conn_ctx.clone());
                let conn = ConnBuilder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, adapter)
                    .into_owned();
                let conn = graceful.watch(conn);

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(cause = %e, "connection closed with error");
                    }
                    // a dropped or drained connection cancels everything
                    // scoped to it
                    conn_ctx.cancel();
                });
            }
            () = shutdown.cancelled() => break,
        }
    }

    drop(listener);
    tokio::select! {
        () = graceful.shutdown() => {
            info!("server drained, shutting down");
        }
        () = tokio::time::sleep(DEFAULT_STOP_TIMEOUT) => {
            warn!("stop timeout elapsed, abandoning in-flight connections");
        }
    }
    // in-flight request contexts die with the server
    ctx.cancel();
}

fn resolve_addr(explicit: Option<&str>) -> String {
    if let Some(addr) = explicit {
        return addr.to_string();
    }
    if let Ok(addr) = env::var("LISTEN_ADDR") {
        return addr;
    }
    if let Ok(port) = env::var("PORT") {
        return format!("0.0.0.0:{port}");
    }
    "127.0.0.1:0".to_string()
}

/// Adapts an [`ArcService`] to hyper's service contract. Also used to serve
/// h2c-upgraded connections.
#[derive(Clone)]
pub(crate) struct HyperAdapter {
    svc: ArcService,
    ctx: Context,
}

impl std::fmt::Debug for HyperAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperAdapter").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl HyperAdapter {
    pub(crate) fn new(svc: ArcService, ctx: Context) -> Self {
        Self { svc, ctx }
    }
}

impl hyper::service::Service<http::Request<Incoming>> for HyperAdapter {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, hreq: http::Request<Incoming>) -> Self::Future {
        let svc = Arc::clone(&self.svc);
        let ctx = self.ctx.clone();
        Box::pin(async move { Ok(handle(svc, ctx, hreq).await) })
    }
}

async fn handle(svc: ArcService, ctx: Context, mut hreq: http::Request<Incoming>) -> http::Response<Body> {
    let upgrade = hreq.extensions_mut().remove::<OnUpgrade>();
    let (parts, incoming) = hreq.into_parts();

    let mut req =
        Request::from_parts(ctx, parts.method, parts.uri, parts.version, parts.headers, Body::stream(incoming));
    if let Some(upgrade) = upgrade {
        req.set_upgrade(upgrade);
    }

    let rsp = svc.call(req).await;
    write_response(rsp)
}

/// Translates a [`Response`] into wire parts. `Content-Length` is dropped:
/// hyper recomputes it from the body's size hint, and a streaming body (no
/// exact hint) goes out chunked with a flush per frame.
fn write_response(rsp: Response) -> http::Response<Body> {
    if rsp.hijacked() {
        debug!("connection hijacked, returning switch response");
    }

    let mut builder = http::Response::builder().status(rsp.status());
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in rsp.headers() {
            if name == CONTENT_LENGTH {
                continue;
            }
            headers.append(name, value.clone());
        }
    }

    match builder.body(rsp.into_body()) {
        Ok(wire) => wire,
        Err(e) => {
            error!(cause = %e, "failed to assemble response, substituting 500");
            http::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .expect("static response")
        }
    }
}

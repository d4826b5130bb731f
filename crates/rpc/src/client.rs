//! The outbound send pipeline.
//!
//! [`send`] dispatches a [`Request`] through the process-wide default client
//! service and hands back a [`ResponseFuture`] immediately, decoupling
//! dispatch from result retrieval. The default service is a pooled HTTP
//! transport behind the [`RoundTripper`] seam, wrapped in the error filter
//! so structured errors decode transparently on the way back.
//!
//! Two lifecycle rules are enforced here:
//!
//! 1. the round trip is raced against the request context, so cancelling the
//!    context aborts the dispatch;
//! 2. a response body belonging to a cancellable request is wrapped in a
//!    [`DoneReader`] with a watcher task, guaranteeing the body is closed
//!    exactly once, by exhaustion or cancellation, whichever comes first.
//!    A caller that forgets to drain a body cannot
//!    leak a pooled connection past its context's lifetime.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as PoolClient;
use hyper_util::rt::TokioExecutor;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error};

use crate::body::{Body, BodyError};
use crate::context::Context;
use crate::error::ServiceError;
use crate::filters::ErrorFilter;
use crate::request::Request;
use crate::response::Response;
use crate::service::{service_fn, ArcService, Service, ServiceExt};

/// Idle connections kept per host by the default transport.
const POOL_MAX_IDLE_PER_HOST: usize = 10;
/// How long an idle pooled connection is kept alive.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("transport error: {source}")]
    Connection {
        #[from]
        source: hyper_util::client::legacy::Error,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn invalid_request<S: ToString>(reason: S) -> Self {
        Self::InvalidRequest { reason: reason.to_string() }
    }
}

/// A pluggable transport: one HTTP round trip.
pub trait RoundTripper: Send + Sync + 'static {
    fn round_trip(&self, req: http::Request<Body>) -> BoxFuture<'static, Result<http::Response<Body>, TransportError>>;
}

/// The default transport: hyper's pooled client with keep-alives.
#[derive(Debug, Clone)]
pub struct HttpRoundTripper {
    client: PoolClient<HttpConnector, Body>,
}

impl Default for HttpRoundTripper {
    fn default() -> Self {
        let client = PoolClient::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build_http();
        Self { client }
    }
}

impl RoundTripper for HttpRoundTripper {
    fn round_trip(&self, req: http::Request<Body>) -> BoxFuture<'static, Result<http::Response<Body>, TransportError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let rsp = client.request(req).await?;
            Ok(rsp.map(Body::stream))
        })
    }
}

/// Wraps `transport` as a [`Service`]: the bare client, with no error
/// decoding attached.
pub fn transport_service(transport: impl RoundTripper) -> impl Service {
    let transport = Arc::new(transport);
    service_fn(move |req: Request| {
        let transport = Arc::clone(&transport);
        async move { round_trip_service(&*transport, req).await }
    })
}

async fn round_trip_service(transport: &dyn RoundTripper, mut req: Request) -> Response {
    let head = req.head();
    let ctx = req.context().clone();

    // a request that failed construction never reaches the wire
    if let Some(err) = req.error() {
        let mut rsp = Response::to_request(head);
        rsp.error = Some(err.clone());
        return rsp;
    }

    let http_req = {
        let mut builder = http::Request::builder().method(req.method().clone()).uri(req.uri().clone());
        if let Some(headers) = builder.headers_mut() {
            *headers = req.headers().clone();
        }
        match builder.body(std::mem::take(req.body_mut())) {
            Ok(r) => r,
            Err(e) => {
                let mut rsp = Response::to_request(head);
                rsp.error = Some(ServiceError::internal_service("transport", e.to_string()));
                return rsp;
            }
        }
    };

    let result = tokio::select! {
        result = transport.round_trip(http_req) => result,
        () = ctx.done() => Err(TransportError::Cancelled),
    };

    let mut rsp = Response::to_request(head);
    match result {
        Ok(http_rsp) => {
            let (parts, body) = http_rsp.into_parts();
            rsp.set_status(parts.status);
            rsp.set_version(parts.version);
            *rsp.headers_mut() = parts.headers;
            rsp.set_body(couple_to_context(body, &ctx));
        }
        Err(e) => {
            debug!(cause = %e, "round trip failed");
            rsp.error = Some(ServiceError::internal_service("transport", e.to_string()));
        }
    }
    rsp
}

/// Ties a streamed response body's lifetime to the request context: a
/// watcher task closes the body when the context is cancelled, unless the
/// body finishes first.
fn couple_to_context(body: Body, ctx: &Context) -> Body {
    let inner = match body {
        Body::Stream(inner) => inner,
        // buffered bodies hold no connection, nothing to couple
        other => return other,
    };

    let (reader, done) = DoneReader::new(inner);
    let watcher = reader.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = ctx.done() => watcher.close(),
            // resolves on full consumption, or errs when the reader is
            // dropped; either way the watcher's job is over
            _ = done => {}
        }
    });

    Body::stream(reader)
}

/// A body wrapper whose close is synchronised with the request context.
///
/// The completion channel returned by [`DoneReader::new`] fires exactly once:
/// when the body is fully consumed or explicitly closed. Closing drops the
/// inner body, which releases the underlying pooled connection.
#[derive(Debug, Clone)]
pub struct DoneReader {
    state: Arc<Mutex<DoneState>>,
}

#[derive(Debug)]
struct DoneState {
    inner: Option<UnsyncBoxBody<Bytes, BodyError>>,
    waker: Option<Waker>,
    done: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl DoneReader {
    pub fn new(inner: UnsyncBoxBody<Bytes, BodyError>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let state = DoneState { inner: Some(inner), waker: None, done: Some(tx), finished: false };
        (Self { state: Arc::new(Mutex::new(state)) }, rx)
    }

    /// Closes the body. Idempotent; pending reads observe the close.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("done reader lock");
        state.inner = None;
        if let Some(done) = state.done.take() {
            let _ = done.send(());
        }
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

impl http_body::Body for DoneReader {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut state = self.state.lock().expect("done reader lock");

        let Some(inner) = state.inner.as_mut() else {
            // closed: a finished body reads as clean EOF, a cancelled one
            // must not masquerade as complete
            return if state.finished { Poll::Ready(None) } else { Poll::Ready(Some(Err(BodyError::Closed))) };
        };

        match Pin::new(inner).poll_frame(cx) {
            Poll::Ready(None) => {
                state.finished = true;
                state.inner = None;
                if let Some(done) = state.done.take() {
                    let _ = done.send(());
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                state.inner = None;
                if let Some(done) = state.done.take() {
                    let _ = done.send(());
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Pending => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        let state = self.state.lock().expect("done reader lock");
        match &state.inner {
            Some(inner) => inner.is_end_stream(),
            None => true,
        }
    }
}

static CLIENT: OnceCell<ArcService> = OnceCell::new();

/// The process-wide default client service: the pooled transport wrapped in
/// the error filter. Initialised on first use.
pub fn client() -> ArcService {
    Arc::clone(CLIENT.get_or_init(|| transport_service(HttpRoundTripper::default()).filter(ErrorFilter).into_arc()))
}

/// Replaces the default client service. Must be called before the first
/// [`send`]; once a dispatch has touched the default it is fixed for the
/// process lifetime.
pub fn set_client(svc: ArcService) {
    if CLIENT.set(svc).is_err() {
        error!("default client already initialised; set_client ignored");
    }
}

/// Dispatches `req` via the default client service.
pub fn send(req: Request) -> ResponseFuture {
    send_via(req, client())
}

/// Dispatches `req` via `svc` on a background task, returning immediately.
pub fn send_via(req: Request, svc: ArcService) -> ResponseFuture {
    let context = req.context().clone();
    let (tx, rx) = oneshot::channel();
    let completed = CancellationToken::new();
    let signal = completed.clone();

    tokio::spawn(async move {
        let rsp = svc.call(req).await;
        if tx.send(rsp).is_err() {
            debug!("response future dropped before completion");
        }
        signal.cancel();
    });

    ResponseFuture { rx, completed, context }
}

/// The eventual [`Response`] of an asynchronous dispatch.
///
/// Exactly one producer task stores the response and fires the completion
/// signal; awaiting the future yields the response, and [`done`] gives a
/// signal that any number of observers can wait on.
///
/// [`done`]: ResponseFuture::done
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Response>,
    completed: CancellationToken,
    context: Context,
}

impl ResponseFuture {
    /// Resolves once the response has been stored. Closed exactly once.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.completed.clone().cancelled_owned()
    }

    /// Cancels the underlying request context. Does not wait: the dispatch
    /// still delivers a response (carrying a transport or cancellation
    /// error) through the future.
    pub fn cancel(&self) {
        self.context.cancel();
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Future for ResponseFuture {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(rsp)) => Poll::Ready(rsp),
            // the producer always sends; reaching this means it panicked
            Poll::Ready(Err(_)) => {
                Poll::Ready(Response::from_error(ServiceError::internal_service("dispatch", "dispatch task died")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

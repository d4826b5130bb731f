//! Deadline enforcement filters.
//!
//! [`TimeoutFilter`] attaches a deadline-derived context to each request and
//! races the service against it; a caller can override the filter's default
//! per request with a `Timeout` header holding integer milliseconds.
//! [`ExpirationFilter`] rejects requests whose context is already done
//! before any work is spent on them.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ServiceError;
use crate::request::Request;
use crate::response::Response;
use crate::service::{ArcService, Filter, Service};

/// Request header overriding the default timeout, in milliseconds.
pub const TIMEOUT_HEADER: &str = "timeout";

/// Enforces a per-request deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutFilter {
    default: Duration,
}

impl TimeoutFilter {
    pub fn new(default: Duration) -> Self {
        Self { default }
    }
}

impl Filter for TimeoutFilter {
    fn apply(&self, mut req: Request, next: ArcService) -> BoxFuture<'static, Response> {
        let default = self.default;
        Box::pin(async move {
            let timeout = req
                .headers()
                .get(TIMEOUT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(default, Duration::from_millis);

            let ctx = req.context().with_timeout(timeout);
            req.set_context(ctx.clone());
            let head = req.head();

            // run the service on its own task so an expired request does not
            // hold up the caller
            let (tx, rx) = oneshot::channel();
            tokio::spawn(async move {
                let rsp = next.call(req).await;
                if tx.send(rsp).is_err() {
                    debug!("timed-out service response discarded");
                }
            });

            tokio::select! {
                rsp = rx => rsp.unwrap_or_else(|_| {
                    Response::from_error(ServiceError::internal_service("dispatch", "service task died"))
                }),
                () = ctx.done() => {
                    let mut rsp = Response::to_request(head);
                    rsp.error = Some(ServiceError::timeout("", "Request timed out"));
                    rsp
                }
            }
        })
    }
}

/// Rejects requests whose context is already done, without invoking the
/// service.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpirationFilter;

impl Filter for ExpirationFilter {
    fn apply(&self, req: Request, next: ArcService) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            if req.context().is_done() {
                let mut rsp = Response::to_request(req.head());
                rsp.error = Some(ServiceError::bad_request("expired", "Request has expired"));
                return rsp;
            }
            next.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::service::{service_fn, ServiceExt};
    use http::Method;

    fn sleepy_service(delay: Duration) -> impl crate::service::Service {
        service_fn(move |req: Request| async move {
            tokio::time::sleep(delay).await;
            req.response()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_service_times_out() {
        let svc = sleepy_service(Duration::from_millis(50)).filter(TimeoutFilter::new(Duration::from_millis(10)));
        let rsp = svc.call(Request::get("http://localhost/")).await;

        let err = rsp.error.expect("deadline must produce an error");
        assert_eq!(err.code, "timeout");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_header_overrides_default() {
        let svc = sleepy_service(Duration::from_millis(50)).filter(TimeoutFilter::new(Duration::from_millis(10)));

        let mut req = Request::get("http://localhost/");
        req.headers_mut().insert(TIMEOUT_HEADER, "10000".parse().unwrap());
        let rsp = svc.call(req).await;
        assert!(rsp.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fast_service_passes() {
        let svc = sleepy_service(Duration::from_millis(1)).filter(TimeoutFilter::new(Duration::from_secs(10)));
        let rsp = svc.call(Request::get("http://localhost/")).await;
        assert!(rsp.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn expired_context_is_rejected_before_the_service() {
        let svc = service_fn(|_req: Request| async move { unreachable!("must not be called") })
            .filter(ExpirationFilter);

        let ctx = Context::background();
        ctx.cancel();
        let rsp = svc.call(Request::new(ctx, Method::GET, "http://localhost/")).await;

        assert_eq!(rsp.error.unwrap().code, "bad_request.expired");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn live_context_passes_through() {
        let svc = service_fn(|req: Request| async move { req.response() }).filter(ExpirationFilter);
        let rsp = svc.call(Request::get("http://localhost/")).await;
        assert!(rsp.error.is_none());
    }
}

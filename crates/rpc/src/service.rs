//! The Service/Filter algebra.
//!
//! A [`Service`] is the atomic unit of both clients and servers: a total
//! asynchronous function from [`Request`] to [`Response`]. Every call
//! produces exactly one response; service and filter code never panics a
//! caller; failures travel as the response's error.
//!
//! A [`Filter`] transforms a service into another service. Chaining reads
//! left to right but executes right to left:
//! `s.filter(f1).filter(f2)` makes `f2` the outermost wrapper, so `f2` sees
//! the request first, forwards into `f1`, which forwards into `s`. That
//! ordering is a contract relied on by the error/timeout/routing filters.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::request::Request;
use crate::response::Response;

/// An asynchronous function from [`Request`] to [`Response`].
pub trait Service: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, Response>;
}

/// A shared, type-erased service handle.
pub type ArcService = Arc<dyn Service>;

impl Service for ArcService {
    fn call(&self, req: Request) -> BoxFuture<'static, Response> {
        (**self).call(req)
    }
}

/// A transformer wrapping a [`Service`] with additional behaviour.
pub trait Filter: Send + Sync + 'static {
    fn apply(&self, req: Request, next: ArcService) -> BoxFuture<'static, Response>;
}

/// Adapts an async function into a [`Service`].
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    ServiceFn { f }
}

pub struct ServiceFn<F> {
    f: F,
}

impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Response> {
        Box::pin((self.f)(req))
    }
}

impl<F> std::fmt::Debug for ServiceFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceFn")
    }
}

/// Adapts an async function into a [`Filter`].
pub fn filter_fn<F, Fut>(f: F) -> FilterFn<F>
where
    F: Fn(Request, ArcService) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    FilterFn { f }
}

pub struct FilterFn<F> {
    f: F,
}

impl<F, Fut> Filter for FilterFn<F>
where
    F: Fn(Request, ArcService) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn apply(&self, req: Request, next: ArcService) -> BoxFuture<'static, Response> {
        Box::pin((self.f)(req, next))
    }
}

impl<F> std::fmt::Debug for FilterFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FilterFn")
    }
}

/// A service wrapped by a filter. Built by [`ServiceExt::filter`].
pub struct Filtered<F> {
    filter: F,
    inner: ArcService,
}

impl<F> std::fmt::Debug for Filtered<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filtered").finish_non_exhaustive()
    }
}

impl<F: Filter> Service for Filtered<F> {
    fn call(&self, req: Request) -> BoxFuture<'static, Response> {
        self.filter.apply(req, Arc::clone(&self.inner))
    }
}

/// Combinators available on every [`Service`].
pub trait ServiceExt: Service + Sized {
    /// Wraps this service with `filter`, yielding a new service. The filter
    /// applied *last* runs *first* on an inbound request.
    fn filter<F: Filter>(self, filter: F) -> Filtered<F> {
        Filtered { filter, inner: Arc::new(self) }
    }

    fn into_arc(self) -> ArcService {
        Arc::new(self)
    }
}

impl<S: Service + Sized> ServiceExt for S {}

//! Method + path routing.
//!
//! Patterns are made of literal segments, `:name` single-segment captures,
//! and a terminal `*name` catch-all capturing the rest of the path,
//! slashes included. Within a segment, literal beats parameter beats
//! catch-all. Matching is backed by one matchit router per HTTP method; the
//! table lives under a reader-writer lock, so registration and lookup can
//! interleave freely.
//!
//! A method mismatch on an otherwise-matching path is reported as a plain
//! miss (`not_found`, not method-not-allowed), a deliberate compatibility
//! choice.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use http::Method;
use thiserror::Error;

use crate::error::ServiceError;
use crate::request::Request;
use crate::response::Response;
use crate::service::{ArcService, Service, ServiceExt};

type MethodTable = HashMap<Method, matchit::Router<ArcService>>;

/// A method+path route table; itself a [`Service`] that dispatches to the
/// best-matching route.
#[derive(Clone, Default)]
pub struct Router {
    table: Arc<RwLock<MethodTable>>,
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("invalid route pattern {pattern}: {source}")]
    InvalidPattern { pattern: String, source: matchit::InsertError },
}

macro_rules! method_register {
    ($name:ident, $method:ident) => {
        pub fn $name(&self, pattern: &str, svc: impl Service) -> Result<(), RouteError> {
            self.register(Method::$method, pattern, svc)
        }
    };
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates (`method`, `pattern`) with `svc`. Conflicting or malformed
    /// patterns are rejected.
    pub fn register(&self, method: Method, pattern: &str, svc: impl Service) -> Result<(), RouteError> {
        let translated = translate(pattern);
        let mut table = self.table.write().expect("router lock");
        table
            .entry(method)
            .or_default()
            .insert(translated, svc.into_arc())
            .map_err(|source| RouteError::InvalidPattern { pattern: pattern.to_string(), source })
    }

    method_register!(get, GET);
    method_register!(post, POST);
    method_register!(put, PUT);
    method_register!(delete, DELETE);
    method_register!(patch, PATCH);
    method_register!(head, HEAD);
    method_register!(options, OPTIONS);

    /// The best-matching service and its captured parameters, or a miss.
    ///
    /// Parameters are copied out: nothing of the matcher's internal state
    /// outlives the call.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<(ArcService, HashMap<String, String>)> {
        let table = self.table.read().expect("router lock");
        let routes = table.get(method)?;
        let matched = routes.at(path).ok()?;
        let params = matched.params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Some((Arc::clone(matched.value), params))
    }

    /// This router as a shared service.
    pub fn into_service(&self) -> ArcService {
        Arc::new(self.clone())
    }
}

impl Service for Router {
    fn call(&self, mut req: Request) -> BoxFuture<'static, Response> {
        let router = self.clone();
        Box::pin(async move {
            match router.lookup(req.method(), req.uri().path()) {
                Some((svc, params)) => {
                    req.set_params(params);
                    svc.call(req).await
                }
                None => {
                    let message = format!("No handler for {} {}", req.method(), req.uri().path());
                    let mut rsp = req.response();
                    rsp.error = Some(ServiceError::not_found("", message));
                    rsp
                }
            }
        })
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

/// Rewrites the public `:name` / `*name` pattern syntax into matchit's
/// `{name}` / `{*name}`.
fn translate(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::service_fn;

    fn tagged(tag: &'static str) -> impl Service {
        service_fn(move |req: Request| async move {
            let mut rsp = req.response();
            rsp.set_body(tag);
            rsp
        })
    }

    async fn body_of(mut rsp: Response) -> String {
        String::from_utf8(rsp.body_bytes(true).await.unwrap().to_vec()).unwrap()
    }

    #[test]
    fn pattern_translation() {
        assert_eq!(translate("/foo/bar"), "/foo/bar");
        assert_eq!(translate("/users/:id/posts"), "/users/{id}/posts");
        assert_eq!(translate("/static/*path"), "/static/{*path}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn registered_route_is_findable() {
        let router = Router::new();
        router.get("/foo", tagged("foo")).unwrap();

        let rsp = router.call(Request::get("http://localhost/foo")).await;
        assert!(rsp.error.is_none());
        assert_eq!(body_of(rsp).await, "foo");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn method_mismatch_is_a_miss() {
        let router = Router::new();
        router.get("/foo", tagged("foo")).unwrap();

        let rsp = router.call(Request::post("http://localhost/foo")).await;
        let err = rsp.error.unwrap();
        assert_eq!(err.code, "not_found");
        assert_eq!(err.message, "No handler for POST /foo");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn unregistered_path_is_a_miss() {
        let router = Router::new();
        router.get("/foo", tagged("foo")).unwrap();

        let rsp = router.call(Request::get("http://localhost/")).await;
        assert_eq!(rsp.error.unwrap().code, "not_found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn params_are_captured() {
        let router = Router::new();
        router
            .get("/users/:id", service_fn(|req: Request| async move {
                let id = req.param("id").unwrap_or("missing").to_string();
                let mut rsp = req.response();
                rsp.set_body(id);
                rsp
            }))
            .unwrap();

        let rsp = router.call(Request::get("http://localhost/users/42")).await;
        assert_eq!(body_of(rsp).await, "42");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn catch_all_captures_remainder_with_slashes() {
        let router = Router::new();
        router
            .get("/*rest", service_fn(|req: Request| async move {
                let rest = req.param("rest").unwrap_or("").to_string();
                let mut rsp = req.response();
                rsp.set_body(rest);
                rsp
            }))
            .unwrap();

        let rsp = router.call(Request::get("http://localhost/a/b/c/d")).await;
        assert_eq!(body_of(rsp).await, "a/b/c/d");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn literal_beats_parameter() {
        let router = Router::new();
        router.get("/users/:id", tagged("param")).unwrap();
        router.get("/users/me", tagged("literal")).unwrap();

        let rsp = router.call(Request::get("http://localhost/users/me")).await;
        assert_eq!(body_of(rsp).await, "literal");
        let rsp = router.call(Request::get("http://localhost/users/7")).await;
        assert_eq!(body_of(rsp).await, "param");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lookup_is_safe_under_concurrent_registration() {
        let router = Router::new();
        router.get("/stable", tagged("stable")).unwrap();

        let writer = router.clone();
        let register = tokio::spawn(async move {
            for i in 0..200 {
                writer.get(&format!("/dynamic/{i}"), tagged("dynamic")).unwrap();
                tokio::task::yield_now().await;
            }
        });

        let reader = router.clone();
        let lookup = tokio::spawn(async move {
            for _ in 0..200 {
                let (_, params) = reader.lookup(&Method::GET, "/stable").expect("stable route");
                assert!(params.is_empty());
                tokio::task::yield_now().await;
            }
        });

        register.await.unwrap();
        lookup.await.unwrap();
    }
}

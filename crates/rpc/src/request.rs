//! The Request value model.
//!
//! A [`Request`] wraps the usual HTTP parts (method, URI, headers, version),
//! a [`Body`], and a [`Context`]. Two invariants hold after construction:
//! the context is always present, and a failure *during* construction (a
//! malformed URL, say) is recorded in the request's `error` field rather
//! than thrown; downstream services short-circuit on it, so callers always
//! hold a well-formed request value.

use std::collections::HashMap;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Uri, Version};
use hyper::upgrade::OnUpgrade;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::body::{Body, BodyError};
use crate::client::{self, ResponseFuture};
use crate::context::Context;
use crate::error::ServiceError;
use crate::response::Response;
use crate::service::ArcService;

/// An HTTP request plus context, construction error and body.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Body,
    context: Context,
    error: Option<ServiceError>,
    params: HashMap<String, String>,
    upgrade: Option<OnUpgrade>,
}

/// The cheaply cloneable head of a request: what a [`Response`] keeps as a
/// back-reference to its originating request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub context: Context,
}

impl Request {
    /// Builds a request. An unparseable `url` does not fail construction:
    /// the error is stored on the request and any downstream service
    /// short-circuits it.
    pub fn new(context: Context, method: Method, url: &str) -> Self {
        let mut req = Self {
            method,
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::empty(),
            context,
            error: None,
            params: HashMap::new(),
            upgrade: None,
        };

        match url.parse::<Uri>() {
            Ok(uri) => req.uri = uri,
            Err(e) => {
                req.error = Some(ServiceError::internal_service("malformed_url", format!("invalid url {url}: {e}")));
            }
        }
        req
    }

    pub fn get(url: &str) -> Self {
        Self::new(Context::background(), Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Context::background(), Method::POST, url)
    }

    /// Assembles a request from pre-parsed wire parts (server side).
    pub fn from_parts(context: Context, method: Method, uri: Uri, version: Version, headers: HeaderMap, body: Body) -> Self {
        Self { method, uri, version, headers, body, context, error: None, params: HashMap::new(), upgrade: None }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Replaces the context, e.g. with a deadline-derived child.
    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    /// The construction-time error, if building the request itself failed.
    pub fn error(&self) -> Option<&ServiceError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: ServiceError) {
        self.error = Some(error);
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// A router-captured path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub(crate) fn set_upgrade(&mut self, upgrade: OnUpgrade) {
        self.upgrade = Some(upgrade);
    }

    /// Takes ownership of the underlying connection's upgrade handle, if the
    /// server offered one. Consuming it is how h2c and hijacking work.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }

    /// The head of this request, for responses to keep as a back-reference.
    pub fn head(&self) -> RequestHead {
        RequestHead { method: self.method.clone(), uri: self.uri.clone(), context: self.context.clone() }
    }

    /// Serialises `v` as JSON into the body and sets the content type.
    ///
    /// Failures are logged and swallowed: the caller still holds a
    /// well-formed request, with an empty body on the failure path.
    pub async fn encode<T: Serialize>(&mut self, v: &T) {
        match serde_json::to_vec(v) {
            Ok(bytes) => {
                if let Err(e) = self.body.write(&bytes).await {
                    warn!(cause = %e, "failed to write encoded request body");
                    return;
                }
                self.headers.insert(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref().parse().expect("static mime"));
            }
            Err(e) => warn!(cause = %e, "failed to encode request body"),
        }
    }

    /// Deserialises the body as JSON. The body is consumed (closed) whether
    /// or not decoding succeeds.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, ServiceError> {
        decode_json(&mut self.body).await
    }

    /// Appends to the body; see [`Body::write`] for the upgrade-on-write
    /// rule.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), BodyError> {
        self.body.write(data).await
    }

    /// The full body as bytes; `consume = false` leaves the bytes readable
    /// again.
    pub async fn body_bytes(&mut self, consume: bool) -> Result<Bytes, BodyError> {
        self.body.bytes(consume).await
    }

    /// Dispatches via the process-wide default client service.
    pub fn send(self) -> ResponseFuture {
        client::send(self)
    }

    /// Dispatches via an explicit service.
    pub fn send_via(self, svc: ArcService) -> ResponseFuture {
        client::send_via(self, svc)
    }

    /// A fresh 200 response targeting this request.
    pub fn response(&self) -> Response {
        Response::to_request(self.head())
    }

    /// A fresh 200 response with `body` encoded as JSON.
    pub fn response_with<T: Serialize>(&self, body: &T) -> Response {
        let mut rsp = self.response();
        rsp.encode(body);
        rsp
    }
}

pub(crate) async fn decode_json<T: DeserializeOwned>(body: &mut Body) -> Result<T, ServiceError> {
    let bytes = body
        .bytes(true)
        .await
        .map_err(|e| ServiceError::bad_request("body_read", e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ServiceError::bad_request("invalid_json", e.to_string()))
}

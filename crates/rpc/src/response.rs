//! The Response value model.
//!
//! A [`Response`] mirrors [`Request`](crate::Request): HTTP parts, a
//! [`Body`], an optional [`ServiceError`], and a back-reference to the head
//! of the originating request. Freshly constructed responses default to
//! status 200 with an empty, mutable header map and a fresh buffer body.
//!
//! Setting `error` never changes the status code by itself; translating
//! errors into wire status/body is the error filter's job.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::body::{Body, BodyError};
use crate::error::ServiceError;
use crate::request::{decode_json, RequestHead};

#[derive(Debug, Default)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Body,
    /// Construction, transport, or decoded remote error.
    pub error: Option<ServiceError>,
    request: Option<RequestHead>,
    hijacked: bool,
}

impl Response {
    /// A fresh 200 response with no originating request.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fresh 200 response targeting `request`.
    pub fn to_request(request: RequestHead) -> Self {
        Self { request: Some(request), ..Self::default() }
    }

    /// A response carrying `error`. The status stays 200: the error filter
    /// owns status translation.
    pub fn from_error(error: ServiceError) -> Self {
        Self { error: Some(error), ..Self::default() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
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

    /// The head of the request this response answers, when known.
    pub fn request(&self) -> Option<&RequestHead> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, request: RequestHead) {
        self.request = Some(request);
    }

    /// Whether a handler has taken over the underlying connection.
    pub fn hijacked(&self) -> bool {
        self.hijacked
    }

    pub fn set_hijacked(&mut self) {
        self.hijacked = true;
    }

    /// A streaming response is written to the wire with a flush per chunk:
    /// either its body is a [`Streamer`](crate::Streamer) pipe, or its
    /// `Transfer-Encoding` contains `chunked`.
    pub fn is_streaming(&self) -> bool {
        if self.body.is_streaming() {
            return true;
        }
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Serialises `v` as JSON into the body; failures are logged and
    /// swallowed, mirroring [`Request::encode`](crate::Request::encode).
    pub fn encode<T: Serialize>(&mut self, v: &T) {
        match serde_json::to_vec(v) {
            Ok(bytes) => {
                self.body = Body::from(bytes);
                self.headers.insert(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref().parse().expect("static mime"));
            }
            Err(e) => warn!(cause = %e, "failed to encode response body"),
        }
    }

    /// Deserialises the body as JSON, consuming it.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, ServiceError> {
        decode_json(&mut self.body).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), BodyError> {
        self.body.write(data).await
    }

    pub async fn body_bytes(&mut self, consume: bool) -> Result<Bytes, BodyError> {
        self.body.bytes(consume).await
    }

    /// An in-place writer proxy over this response.
    pub fn writer(&mut self) -> ResponseWriter<'_> {
        ResponseWriter { rsp: self }
    }
}

/// A proxy implementing the usual response-writer surface over a
/// [`Response`] value: status, headers, raw writes, plus JSON and error
/// conveniences.
#[derive(Debug)]
pub struct ResponseWriter<'a> {
    rsp: &'a mut Response,
}

impl ResponseWriter<'_> {
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.rsp.headers
    }

    /// Sets the status line, like `WriteHeader` on a wire writer.
    pub fn write_header(&mut self, status: StatusCode) {
        self.rsp.status = status;
    }

    /// Appends raw bytes to the body.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), BodyError> {
        self.rsp.write(data).await
    }

    /// Writes `v` as a JSON body with the matching content type.
    pub fn write_json<T: Serialize>(&mut self, v: &T) {
        self.rsp.encode(v);
    }

    /// Records `err` on the response. The status is left alone: the error
    /// filter marshals the error onto the wire and derives the status from
    /// its code.
    pub fn write_error(&mut self, err: ServiceError) {
        self.rsp.error = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::streamer::Streamer;

    #[test]
    fn fresh_response_defaults() {
        let req = Request::get("http://localhost/");
        let rsp = req.response();

        assert_eq!(rsp.status(), StatusCode::OK);
        assert!(rsp.headers().is_empty());
        assert!(rsp.error.is_none());
        assert_eq!(rsp.request().unwrap().uri.path(), "/");
    }

    #[test]
    fn setting_error_keeps_status() {
        let mut rsp = Response::empty();
        rsp.error = Some(ServiceError::unauthorized("", "nope"));
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    #[test]
    fn streaming_detection() {
        let mut rsp = Response::empty();
        assert!(!rsp.is_streaming());

        rsp.headers_mut().insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        assert!(rsp.is_streaming());

        let (_writer, streamer) = Streamer::pipe();
        let mut rsp = Response::empty();
        rsp.set_body(streamer);
        assert!(rsp.is_streaming());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn writer_proxy_round_trip() {
        let mut rsp = Response::empty();
        let mut writer = rsp.writer();

        writer.write_header(StatusCode::CREATED);
        writer.write(b"partial").await.unwrap();

        assert_eq!(rsp.status(), StatusCode::CREATED);
        assert_eq!(rsp.body_bytes(true).await.unwrap(), Bytes::from("partial"));
    }

    #[test]
    fn write_error_records_without_touching_status() {
        let mut rsp = Response::empty();
        rsp.writer().write_error(ServiceError::not_found("", "gone"));

        assert_eq!(rsp.status(), StatusCode::OK);
        assert!(rsp.error.as_ref().unwrap().matches(crate::error::codes::NOT_FOUND));
    }
}

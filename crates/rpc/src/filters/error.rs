//! Bidirectional translation between structured errors and the HTTP
//! envelope.
//!
//! On the wire an error response carries three things: an HTTP status mapped
//! from the error's code class, a `Terror: 1` marker header, and a body
//! holding the structured error: protobuf when the content type says so
//! (`application/x-protobuf`, `application/protobuf` or
//! `application/octet-stream` are all accepted), JSON otherwise.
//!
//! One filter serves both directions. Wrapping a server service it marshals
//! errors outbound; wrapping a client transport it decodes them inbound.
//! The logic is symmetric, so the same code path covers a service that
//! produced `error` + status 200 (marshal) and a response arriving with a
//! 4xx/5xx status (decode).

use std::collections::HashMap;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use prost::Message;
use tracing::warn;

use crate::error::{code_for_status, ServiceError, StackFrame};
use crate::request::Request;
use crate::response::Response;
use crate::service::{ArcService, Filter, Service};

/// Marker header identifying a body as a structured error envelope.
pub const TERROR_HEADER: &str = "terror";

const PROTOBUF_CONTENT_TYPES: &[&str] = &["application/x-protobuf", "application/protobuf", "application/octet-stream"];

/// The filter sitting at the boundary between structured application errors
/// and the HTTP envelope. See the module docs for the protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorFilter;

impl Filter for ErrorFilter {
    fn apply(&self, req: Request, next: ArcService) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            let head = req.head();

            // a request that failed construction never reaches the service
            let mut rsp = match req.error() {
                Some(err) => {
                    let mut rsp = Response::to_request(head.clone());
                    rsp.error = Some(err.clone());
                    rsp
                }
                None => next.call(req).await,
            };

            if rsp.request().is_none() {
                rsp.set_request(head);
            }

            let status = rsp.status();
            if rsp.error.is_some() {
                // an error the service attached locally: marshal it, unless
                // the service also shaped the wire response itself
                if status == StatusCode::OK {
                    marshal_onto(&mut rsp);
                }
            } else if status.as_u16() >= 400 && status.as_u16() <= 599 {
                decode_from(&mut rsp).await;
            }

            rsp
        })
    }
}

/// Writes the response's error onto the wire: status from the code, marker
/// header, encoded body.
fn marshal_onto(rsp: &mut Response) {
    let Some(mut err) = rsp.error.clone() else { return };

    let status = err.status();
    err.message = err.message_or_default(status);

    let protobuf = wants_protobuf(rsp.headers());
    let (bytes, content_type) = if protobuf {
        (encode_protobuf(&err), mime_protobuf())
    } else {
        match serde_json::to_vec(&err) {
            Ok(bytes) => (Bytes::from(bytes), mime::APPLICATION_JSON.as_ref()),
            Err(e) => {
                warn!(cause = %e, code = %err.code, "failed to marshal error body");
                (Bytes::new(), mime::APPLICATION_JSON.as_ref())
            }
        }
    };

    rsp.set_status(status);
    rsp.set_body(bytes.to_vec());
    rsp.headers_mut().insert(CONTENT_TYPE, content_type.parse().expect("static mime"));
    rsp.headers_mut().insert(TERROR_HEADER, "1".parse().expect("static header value"));
    rsp.error = Some(err);
}

/// Reads a structured (or plain) error off a 4xx/5xx response.
async fn decode_from(rsp: &mut Response) {
    let status = rsp.status();
    let bytes = match rsp.body_bytes(false).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(cause = %e, "failed to read error response body");
            rsp.error = Some(ServiceError::new(code_for_status(status), format!("Response error ({})", status.as_u16())));
            return;
        }
    };

    let marked = rsp.headers().get(TERROR_HEADER).is_some_and(|v| v.as_bytes() == b"1");
    let mut err = if marked {
        unmarshal(&bytes, rsp.headers()).unwrap_or_else(|| {
            ServiceError::new(code_for_status(status), String::from_utf8_lossy(&bytes).into_owned())
        })
    } else {
        ServiceError::new(code_for_status(status), String::from_utf8_lossy(&bytes).into_owned())
    };

    err.message = err.message_or_default(status);
    rsp.error = Some(err);
}

fn wants_protobuf(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
        .is_some_and(|ct| PROTOBUF_CONTENT_TYPES.contains(&ct))
}

fn mime_protobuf() -> &'static str {
    PROTOBUF_CONTENT_TYPES[0]
}

fn unmarshal(bytes: &[u8], headers: &HeaderMap) -> Option<ServiceError> {
    if wants_protobuf(headers) {
        wire::Error::decode(bytes).ok().map(ServiceError::from)
    } else {
        serde_json::from_slice(bytes).ok()
    }
}

fn encode_protobuf(err: &ServiceError) -> Bytes {
    Bytes::from(wire::Error::from(err.clone()).encode_to_vec())
}

/// The protobuf rendition of the error envelope.
mod wire {
    use super::{HashMap, ServiceError, StackFrame};

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Error {
        #[prost(string, tag = "1")]
        pub code: String,
        #[prost(string, tag = "2")]
        pub message: String,
        #[prost(map = "string, string", tag = "3")]
        pub params: HashMap<String, String>,
        #[prost(message, repeated, tag = "4")]
        pub stack: Vec<Frame>,
        #[prost(bool, optional, tag = "5")]
        pub retryable: Option<bool>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Frame {
        #[prost(string, tag = "1")]
        pub filename: String,
        #[prost(string, tag = "2")]
        pub method: String,
        #[prost(uint32, tag = "3")]
        pub line: u32,
    }

    impl From<ServiceError> for Error {
        fn from(err: ServiceError) -> Self {
            Self {
                code: err.code,
                message: err.message,
                params: err.params,
                stack: err
                    .stack
                    .into_iter()
                    .map(|f| Frame { filename: f.filename, method: f.method, line: f.line })
                    .collect(),
                retryable: err.retryable,
            }
        }
    }

    impl From<Error> for ServiceError {
        fn from(err: Error) -> Self {
            Self {
                code: err.code,
                message: err.message,
                params: err.params,
                stack: err
                    .stack
                    .into_iter()
                    .map(|f| StackFrame { filename: f.filename, method: f.method, line: f.line })
                    .collect(),
                retryable: err.retryable,
            }
        }
    }
}

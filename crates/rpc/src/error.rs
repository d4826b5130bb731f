//! Structured service errors.
//!
//! A [`ServiceError`] is a *value* that crosses process boundaries: a
//! hierarchical dotted code, a human-readable message, a public parameter
//! map, an optional stack and an optional retryable hint. The code prefix
//! (everything before the first `.`) is the canonical class and decides the
//! HTTP status an error travels under; the mapping lives here so both sides
//! of the wire agree on it.

use std::collections::HashMap;
use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Canonical error classes, stable on the wire.
pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const BAD_RESPONSE: &str = "bad_response";
    pub const FORBIDDEN: &str = "forbidden";
    pub const INTERNAL_SERVICE: &str = "internal_service";
    pub const NOT_FOUND: &str = "not_found";
    pub const PRECONDITION_FAILED: &str = "precondition_failed";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const TIMEOUT: &str = "timeout";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const UNKNOWN: &str = "unknown";
}

/// One frame of an error's originating stack, carried for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    pub method: String,
    pub line: u32,
}

/// An error with a hierarchical code, suitable for crossing service
/// boundaries intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

macro_rules! coded_constructor {
    ($name:ident, $code:ident) => {
        /// Constructs an error of this class. A non-empty `sub` is appended
        /// to the class with a `.` separator.
        pub fn $name(sub: &str, message: impl Into<String>) -> Self {
            Self::with_class(codes::$code, sub, message)
        }
    };
}

impl ServiceError {
    /// Constructs an error with a verbatim dotted code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), params: HashMap::new(), stack: Vec::new(), retryable: None }
    }

    fn with_class(class: &str, sub: &str, message: impl Into<String>) -> Self {
        let code = if sub.is_empty() { class.to_string() } else { format!("{class}.{sub}") };
        Self::new(code, message)
    }

    coded_constructor!(bad_request, BAD_REQUEST);
    coded_constructor!(bad_response, BAD_RESPONSE);
    coded_constructor!(forbidden, FORBIDDEN);
    coded_constructor!(internal_service, INTERNAL_SERVICE);
    coded_constructor!(not_found, NOT_FOUND);
    coded_constructor!(precondition_failed, PRECONDITION_FAILED);
    coded_constructor!(rate_limited, RATE_LIMITED);
    coded_constructor!(timeout, TIMEOUT);
    coded_constructor!(unauthorized, UNAUTHORIZED);
    coded_constructor!(unknown, UNKNOWN);

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// The canonical class: the code prefix before the first `.`.
    pub fn class(&self) -> &str {
        code_class(&self.code)
    }

    /// Whether this error's class matches `class` exactly or as a prefix of
    /// a dotted sub-code.
    pub fn matches(&self, class: &str) -> bool {
        self.class() == code_class(class)
    }

    /// The HTTP status this error travels under.
    pub fn status(&self) -> StatusCode {
        status_for_code(&self.code)
    }

    /// Message, with empty strings normalised so logs are never silent.
    pub fn message_or_default(&self, status: StatusCode) -> String {
        if self.message.is_empty() {
            format!("Response error ({})", status.as_u16())
        } else {
            self.message.clone()
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ServiceError {}

fn code_class(code: &str) -> &str {
    code.split('.').next().unwrap_or(code)
}

/// Maps a dotted error code to its HTTP status. Unknown classes map to 500.
pub fn status_for_code(code: &str) -> StatusCode {
    match code_class(code) {
        codes::BAD_REQUEST => StatusCode::BAD_REQUEST,
        codes::UNAUTHORIZED => StatusCode::UNAUTHORIZED,
        codes::FORBIDDEN => StatusCode::FORBIDDEN,
        codes::NOT_FOUND => StatusCode::NOT_FOUND,
        codes::BAD_RESPONSE => StatusCode::NOT_ACCEPTABLE,
        codes::PRECONDITION_FAILED => StatusCode::PRECONDITION_FAILED,
        codes::RATE_LIMITED => StatusCode::TOO_MANY_REQUESTS,
        codes::TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Maps an HTTP status back to its canonical error class. Unknown statuses
/// map to `internal_service`.
pub fn code_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => codes::BAD_REQUEST,
        StatusCode::UNAUTHORIZED => codes::UNAUTHORIZED,
        StatusCode::FORBIDDEN => codes::FORBIDDEN,
        StatusCode::NOT_FOUND => codes::NOT_FOUND,
        StatusCode::NOT_ACCEPTABLE => codes::BAD_RESPONSE,
        StatusCode::PRECONDITION_FAILED => codes::PRECONDITION_FAILED,
        StatusCode::TOO_MANY_REQUESTS => codes::RATE_LIMITED,
        StatusCode::GATEWAY_TIMEOUT => codes::TIMEOUT,
        _ => codes::INTERNAL_SERVICE,
    }
}

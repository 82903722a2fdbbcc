use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;

use crate::envelope::Envelope;

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One OpenAI-compatible chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Error codes carried in `agentToUi/error` payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    MissingConfig,
    EmptyContent,
    BadJson,
    UpstreamError,
    UnexpectedJsonShape,
    JsonlParseError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::MissingConfig => "missing_config",
            Self::EmptyContent => "empty_content",
            Self::BadJson => "bad_json",
            Self::UpstreamError => "upstream_error",
            Self::UnexpectedJsonShape => "unexpected_json_shape",
            Self::JsonlParseError => "jsonl_parse_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("provider configuration missing: {}", .0.join(", "))]
    MissingConfig(Vec<&'static str>),

    #[error("model returned empty content")]
    EmptyContent,

    #[error("model did not return valid JSON")]
    BadJson(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("upstream call exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("client disconnected")]
    ClientDisconnected,
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::MissingConfig(_) => ErrorCode::MissingConfig,
            Self::EmptyContent => ErrorCode::EmptyContent,
            Self::BadJson(_) => ErrorCode::BadJson,
            _ => ErrorCode::UpstreamError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MissingConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::MissingConfig(need) => Some(serde_json::json!({ "need": need })),
            Self::BadJson(raw) => Some(serde_json::json!({
                "raw": crate::str_utils::prefix_chars(raw, crate::constants::BAD_JSON_RAW_CHARS),
            })),
            Self::Upstream(status, _) => Some(serde_json::json!({ "status": status.as_u16() })),
            _ => None,
        }
    }

    /// The backend error envelope describing this failure.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(self.code(), self.to_string(), self.details())
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self.inner, RelayError::ClientDisconnected)
    }
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let status = self.inner.status();
        if status.is_server_error() {
            tracing::error!(code = %self.inner.code(), "{}", self);
        } else {
            tracing::warn!(code = %self.inner.code(), "{}", self.inner);
        }
        (status, axum::Json(self.inner.to_envelope())).into_response()
    }
}

//! Error types for the ShareHub client

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-2xx response carrying the server-reported detail
    #[error("{message}")]
    Api { status: u16, message: String },

    /// The refresh call itself failed
    #[error("Token refresh failed: {0}")]
    Refresh(String),

    /// A refreshed token pair could not be saved; the previous session is kept
    #[error("Failed to persist credentials: {0}")]
    Persist(String),

    #[error("Session expired, please login again")]
    SessionExpired,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Hosts should treat the user as logged out when this returns true
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ClientError::SessionExpired)
    }

    /// HTTP status of an API error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::HttpRequest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Build an `Api` error from a failed response body
    pub(crate) fn from_error_body(status: StatusCode, body: &[u8]) -> Self {
        ClientError::Api {
            status: status.as_u16(),
            message: error_message(status, body),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// `{detail: string | [{loc, msg, type}, ...]}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Message(String),
    Fields(Vec<FieldError>),
}

#[derive(Debug, Deserialize)]
struct FieldError {
    #[serde(default, rename = "loc")]
    #[allow(dead_code)]
    location: Vec<serde_json::Value>,
    #[serde(rename = "msg")]
    message: String,
    #[serde(default, rename = "type")]
    #[allow(dead_code)]
    kind: String,
}

/// Flatten an error body into a single human-readable message
pub(crate) fn error_message(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { detail: ErrorDetail::Message(message) }) => message,
        Ok(ErrorBody { detail: ErrorDetail::Fields(fields) }) => fields
            .into_iter()
            .map(|f| f.message)
            .collect::<Vec<_>>()
            .join(", "),
        Err(_) => format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        ),
    }
}

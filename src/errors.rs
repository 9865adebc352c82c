//! Error types for the trace-migrate crate.
//!
//! This module defines a unified error enumeration used across the HTTP
//! client, pagination, session persistence, and every kind migrator. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants bind the wire-level failure taxonomy (auth, not-found,
//!   conflict, rate limit, server, network, protocol) plus the client-side
//!   outcomes (validation, unmapped reference, integrity, skip policy).

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the trace-migrate library.
///
/// - Used across the HTTP client, session store and kind migrators.
/// - Implements `std::error::Error` via `thiserror`.
pub enum MigrateError {
    /// 401 from the platform. The API key is invalid or expired. Never
    /// retried; aborts the whole run.
    #[error("authentication failed for `{endpoint}`: {detail}")]
    Authentication { endpoint: String, detail: String },

    /// 403 from the platform. The key is valid but lacks permission for the
    /// operation. Never retried; aborts the whole run.
    #[error("access denied for `{endpoint}`: {detail}")]
    Authorization { endpoint: String, detail: String },

    /// 404 from the platform. Returned intact so callers can probe multiple
    /// candidate endpoints.
    #[error("resource not found at `{endpoint}`: {detail}")]
    NotFound { endpoint: String, detail: String },

    /// 409 from the platform. Returned intact so batch splitting can isolate
    /// the offending record; not retried.
    #[error("resource conflict at `{endpoint}`: {detail}")]
    Conflict { endpoint: String, detail: String },

    /// 429 from the platform. Always retried; `retry_after` carries the
    /// server hint in seconds when the response exposed one.
    #[error("rate limit exceeded for `{endpoint}`")]
    RateLimited {
        endpoint: String,
        retry_after: Option<f64>,
    },

    /// Any 5xx from the platform. Retried with exponential backoff.
    #[error("server error {status} at `{endpoint}`: {detail}")]
    Server {
        endpoint: String,
        status: u16,
        detail: String,
    },

    /// Connect/read timeout or connection reset. Retried with exponential
    /// backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Non-JSON body on a 2xx, or otherwise malformed payload. Fatal.
    #[error("invalid response from `{endpoint}`: {detail}")]
    Protocol { endpoint: String, detail: String },

    /// Client-side pre-flight rejection (configuration, argument shapes).
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A dependency is missing from the ID-map at write time. The affected
    /// child is skipped, never written with a dangling reference.
    #[error("unmapped {kind} reference: {id}")]
    UnmappedReference { kind: &'static str, id: String },

    /// An invariant of the migrated data would be violated (e.g. a run
    /// without a trace root).
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// A policy outcome, not a failure: the resource was deliberately not
    /// written and the reason explains why.
    #[error("skipped: {0}")]
    Skipped(String),

    /// Session file could not be parsed or written.
    #[error("session state error: {0}")]
    State(String),

    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    pub fn not_found(endpoint: &str, detail: impl Into<String>) -> Self {
        MigrateError::NotFound {
            endpoint: endpoint.to_string(),
            detail: detail.into(),
        }
    }

    pub fn conflict(endpoint: &str, detail: impl Into<String>) -> Self {
        MigrateError::Conflict {
            endpoint: endpoint.to_string(),
            detail: detail.into(),
        }
    }

    pub fn protocol(endpoint: &str, detail: impl Into<String>) -> Self {
        MigrateError::Protocol {
            endpoint: endpoint.to_string(),
            detail: detail.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MigrateError::Validation(msg.into())
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        MigrateError::Skipped(reason.into())
    }

    /// Whether the error class is eligible for in-place retry by the HTTP
    /// client. Auth, conflict and protocol errors are terminal by design.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrateError::RateLimited { .. }
                | MigrateError::Server { .. }
                | MigrateError::Network(_)
        )
    }

    /// Whether the error must abort the whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Authentication { .. } | MigrateError::Authorization { .. }
        )
    }

    /// The 409 detail text, when this is a conflict.
    pub fn conflict_detail(&self) -> Option<&str> {
        match self {
            MigrateError::Conflict { detail, .. } => Some(detail.as_str()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        MigrateError::Network(err.to_string())
    }
}

//! Error types for the svcmsg substrate.
//!
//! Errors fall into five groups: registration errors (fatal to one
//! `register` call), transport errors (connection-level, synthesized by the
//! client or server and never carried in a reply), protocol errors (malformed
//! messages rejected before application code runs), application errors
//! (status codes chosen by a worker callback) and discarded late replies,
//! which are never reported at all.

use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for svcmsg.
#[derive(Debug, Error)]
pub enum SvcError {
    // Registration errors
    #[error("Service already registered: {name} (instance {instance})")]
    DuplicateService { name: String, instance: String },

    #[error("Service capacity exceeded: at most {limit} services may be registered")]
    CapacityExceeded { limit: usize },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Transport errors
    #[error("Service not found: {name} (instance {instance})")]
    ServiceNotFound { name: String, instance: String },

    #[error("Permission denied opening {service}")]
    PermissionDenied { service: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request interrupted by local close")]
    Interrupted,

    #[error("Peer went away: {message}")]
    PeerGone { message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Protocol errors
    #[error("Protocol error {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Namespace database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Application errors
    #[error("Application status {code}")]
    Application { code: i32, payload: Bytes },
}

/// Result type alias for svcmsg operations.
pub type Result<T> = std::result::Result<T, SvcError>;

impl From<std::io::Error> for SvcError {
    fn from(err: std::io::Error) -> Self {
        SvcError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SvcError {
    fn from(err: serde_json::Error) -> Self {
        SvcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for SvcError {
    fn from(err: rusqlite::Error) -> Self {
        SvcError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Substrate status codes carried in reply headers.
///
/// `0` is success, positive codes belong to applications, and the range
/// `-32700..=-32000` is reserved for the substrate.
pub mod status {
    pub const OK: i32 = 0;
    /// Frame or header could not be decoded.
    pub const PARSE_ERROR: i32 = -32700;
    /// Message failed validation (length, type, wrong object).
    pub const BAD_MESSAGE: i32 = -32600;
    /// OPEN named a service this server does not host.
    pub const NO_SUCH_SERVICE: i32 = -32601;
    /// Message referenced an OSB that is not open on this connection.
    pub const NO_SUCH_OBJECT: i32 = -32602;
    /// Internal substrate failure.
    pub const INTERNAL: i32 = -32603;
    /// Connection or pending-reply limit reached.
    pub const BUSY: i32 = -32000;
    /// Access control refused the OPEN.
    pub const PERMISSION_DENIED: i32 = -32001;
    /// A request or deferred token was dropped without a reply.
    pub const BROKEN_REPLY: i32 = -32002;
    /// Message id already awaiting a reply on this OSB.
    pub const DUPLICATE_MSG_ID: i32 = -32003;
    /// The service does not implement the requested operation.
    pub const NOT_SUPPORTED: i32 = -32004;

    /// Whether `code` lies in the substrate-reserved range.
    pub fn is_substrate(code: i32) -> bool {
        (-32700..=-32000).contains(&code)
    }
}

impl SvcError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SvcError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Build the client-side error for a non-zero reply status.
    ///
    /// Substrate codes become protocol (or permission) errors; everything
    /// else is an application status and keeps the reply payload.
    pub fn from_status(code: i32, payload: Bytes, service: &str) -> Self {
        match code {
            status::PERMISSION_DENIED => SvcError::PermissionDenied {
                service: service.to_string(),
            },
            c if status::is_substrate(c) => SvcError::Protocol {
                code: c,
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
            c => SvcError::Application { code: c, payload },
        }
    }

    /// Convert to a status code for a reply header.
    pub fn to_status_code(&self) -> i32 {
        match self {
            SvcError::Protocol { code, .. } => *code,
            SvcError::Application { code, .. } => *code,
            SvcError::Json { .. } => status::PARSE_ERROR,
            SvcError::ServiceNotFound { .. } => status::NO_SUCH_SERVICE,
            SvcError::PermissionDenied { .. } => status::PERMISSION_DENIED,
            SvcError::CapacityExceeded { .. } => status::BUSY,
            _ => status::INTERNAL,
        }
    }

    /// Whether this failure came from the transport rather than a reply.
    ///
    /// Callers use this to decide whether retrying is meaningful: transport
    /// failures may clear up, application statuses are deliberate answers.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SvcError::ServiceNotFound { .. }
                | SvcError::PermissionDenied { .. }
                | SvcError::Timeout(_)
                | SvcError::ConnectionClosed
                | SvcError::Interrupted
                | SvcError::PeerGone { .. }
                | SvcError::Io { .. }
        )
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SvcError::Timeout(_) | SvcError::PeerGone { .. } | SvcError::Interrupted
        ) || matches!(self, SvcError::Protocol { code, .. } if *code == status::BUSY)
    }
}

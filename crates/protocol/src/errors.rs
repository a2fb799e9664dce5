//! Error taxonomy and retry-policy types for the ia-cloud connection layer.
//!
//! [`IaCloudError`] is the single failure vocabulary shared by every crate in
//! the workspace. Transports map their low-level failures onto it; the
//! orchestrator propagates it unchanged after its own recovery is exhausted.
//!
//! [`RetryPolicy`] is how an error tells the orchestrator whether repeating
//! the submit-and-validate cycle can help.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed cause carried by error kinds whose origin lives in another crate
/// (HTTP client, websocket library, file system).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried; the failure is local and repeating
    /// the request would fail the same way.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Every failure the connection layer can surface.
///
/// The first four variants describe exchanges with the remote service and
/// are retried by the orchestrator. The remaining variants are local
/// precondition or environment failures detected before anything is sent.
#[derive(Debug, Error)]
pub enum IaCloudError {
    /// The response bytes did not parse as the expected JSON structure.
    #[error("Bad response JSON")]
    JsonParse {
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },

    /// Transport-level failure: connection refused, DNS failure, socket
    /// timeout, non-success HTTP status, or exhausted reconnect attempts.
    #[error("ia-cloud lower protocol error: {message}")]
    LowerProtocol {
        /// Short description of what failed.
        message: String,
        /// Wrapped cause, when one exists.
        #[source]
        source: Option<BoxError>,
    },

    /// A single request exceeded its deadline although the connection itself
    /// may still be healthy.
    #[error("ia-cloud request timed out after {after:?}")]
    Timeout {
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The response parsed correctly but is inconsistent with the request
    /// that produced it.
    #[error("ia-cloud API error: {reason}")]
    Api {
        /// Which check failed.
        reason: String,
    },

    /// A local precondition failed; nothing was sent.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Description of the violated precondition.
        reason: String,
    },

    /// The file attached to a file-data object could not be read.
    #[error("Cannot read attachment '{}'", path.display())]
    Attachment {
        /// Path taken from the object's "file path" entry.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The connection store could not load or save connection state.
    #[error("Connection store error: {message}")]
    Persistence {
        /// Description of the store failure.
        message: String,
        /// Wrapped cause, when one exists.
        #[source]
        source: Option<BoxError>,
    },
}

impl IaCloudError {
    /// Creates a [`IaCloudError::LowerProtocol`] without a wrapped cause.
    pub fn lower(message: impl Into<String>) -> Self {
        Self::LowerProtocol {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a [`IaCloudError::LowerProtocol`] wrapping `source`.
    pub fn lower_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::LowerProtocol {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a [`IaCloudError::Api`] validation failure.
    pub fn api(reason: impl Into<String>) -> Self {
        Self::Api {
            reason: reason.into(),
        }
    }

    /// Creates a [`IaCloudError::InvalidRequest`] precondition failure.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Creates a [`IaCloudError::Persistence`] failure wrapping `source`.
    pub fn persistence(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::JsonParse { .. } => "JSON_PARSE_ERR",
            Self::LowerProtocol { .. } => "IACLOUD_LOWER_ERR",
            Self::Timeout { .. } => "IACLOUD_TIMEDOUT_ERR",
            Self::Api { .. } => "IACLOUD_API_ERR",
            Self::InvalidRequest { .. } => "IACLOUD_INVALID_REQ",
            Self::Attachment { .. } => "IACLOUD_ATTACHMENT_ERR",
            Self::Persistence { .. } => "IACLOUD_STORE_ERR",
        }
    }

    /// Whether the orchestrator may repeat the operation after this error.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::JsonParse { .. }
            | Self::LowerProtocol { .. }
            | Self::Timeout { .. }
            | Self::Api { .. } => RetryPolicy::Retryable { after: None },
            Self::InvalidRequest { .. } | Self::Attachment { .. } | Self::Persistence { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

impl From<serde_json::Error> for IaCloudError {
    fn from(source: serde_json::Error) -> Self {
        Self::JsonParse { source }
    }
}

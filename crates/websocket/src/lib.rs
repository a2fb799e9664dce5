//! ia-cloud duplex transport.
//!
//! Implements the [`protocol::Transport`] trait over one long-lived
//! websocket. Many logical requests share the connection: each submission
//! carries a fresh correlation `id`, and the reader task routes every
//! response to the caller waiting on that id, in whatever order responses
//! arrive.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Socket ownership, correlation, per-request timeout and
//! reconnection supervision all live here. The orchestrator sees only
//! [`protocol::Transport`].
//!
//! ## Failure handling
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | initial connect fails | `LowerProtocol` from [`DuplexSession::open`] |
//! | request deadline passes | `Timeout`; entry removed, late reply discarded |
//! | connection ends | every pending request rejected with `LowerProtocol` |
//! | reconnect attempts exhausted | `LowerProtocol("can't open connection")` |

mod pending;
mod session;

use std::time::Duration;

use protocol::{ConnectionInfo, FdsKey};
use thiserror::Error;
use url::Url;

pub use session::DuplexSession;

/// Reconnect attempts made before giving up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Total time the reconnect attempts are spread over.
pub const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(30);

/// The configured service URL could not be turned into a websocket endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid websocket URL '{url}'")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported URL scheme '{0}' (expected ws or wss)")]
    UnsupportedScheme(String),
}

/// Settings for [`DuplexSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct DuplexConfig {
    /// Full websocket URL including the `FDSKey` query parameter.
    pub endpoint: String,
    /// Deadline applied to each request sent through the [`protocol::Transport`] impl.
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_window: Duration,
}

impl DuplexConfig {
    /// Creates a config with default timeout and reconnect bounds.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: Duration::from_millis(protocol::DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_window: DEFAULT_RECONNECT_WINDOW,
        }
    }

    /// Derives the session settings from persisted connection state.
    pub fn for_connection(info: &ConnectionInfo) -> Result<Self, EndpointError> {
        let endpoint = endpoint_url(info.url(), info.fds_key())?;
        Ok(Self {
            request_timeout: info.request_timeout(),
            ..Self::new(endpoint)
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, window: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_window = window;
        self
    }
}

/// Appends the percent-encoded `FDSKey` query parameter to `base`.
pub fn endpoint_url(base: &str, fds_key: &FdsKey) -> Result<String, EndpointError> {
    let mut url = Url::parse(base).map_err(|source| EndpointError::InvalidUrl {
        url: base.to_owned(),
        source,
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(EndpointError::UnsupportedScheme(url.scheme().to_owned()));
    }
    url.query_pairs_mut().append_pair("FDSKey", fds_key.as_str());
    Ok(url.into())
}

//! Shared value types: persisted connection state, credentials, and time.
//!
//! [`ConnectionInfo`] is the one piece of mutable state that outlives a single
//! call. Its status/serviceID pair is kept consistent by construction: the
//! only way to change it is through [`ConnectionInfo::mark_connected`],
//! [`ConnectionInfo::rotate_service_id`] and
//! [`ConnectionInfo::mark_disconnected`].

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FdsKey, ServiceId};

/// Request timeout applied when the stored state does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Protocol selection
// ---------------------------------------------------------------------------

/// Which transport and connect-request dialect a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// One-shot HTTPS; the connect request also carries `userID`.
    #[serde(rename = "REST1")]
    Rest1,
    /// One-shot HTTPS.
    #[serde(rename = "REST2")]
    Rest2,
    /// Persistent websocket; credentials travel in the connect request.
    #[serde(rename = "websocket")]
    Websocket,
}

impl Protocol {
    /// Returns `true` for the multiplexed websocket transport.
    pub fn is_duplex(self) -> bool {
        matches!(self, Self::Websocket)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rest1 => "REST1",
            Self::Rest2 => "REST2",
            Self::Websocket => "websocket",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REST1" => Ok(Self::Rest1),
            "REST2" => Ok(Self::Rest2),
            "websocket" => Ok(Self::Websocket),
            other => Err(format!("unknown protocol '{other}' (expected REST1, REST2 or websocket)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Logical session state tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// A serviceID has been issued and is current.
    Connected,
    /// No live session.
    #[default]
    Disconnected,
}

// ---------------------------------------------------------------------------
// Persisted connection state
// ---------------------------------------------------------------------------

/// Persisted state of one logical session.
///
/// Serialized with the field names the host configuration uses (`FDSKey`,
/// `serviceID`, `reqTimeout`, `cnctTs`, `lastReqTs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredConnectionInfo", into = "StoredConnectionInfo")]
pub struct ConnectionInfo {
    protocol: Protocol,
    url: String,
    fds_key: FdsKey,
    service_id: Option<ServiceId>,
    request_timeout: Duration,
    proxy: Option<String>,
    comment: String,
    connected_at: Option<Timestamp>,
    last_request_at: Option<Timestamp>,
}

impl ConnectionInfo {
    /// Creates disconnected state for a new session.
    pub fn new(protocol: Protocol, url: impl Into<String>, fds_key: FdsKey) -> Self {
        Self {
            protocol,
            url: url.into(),
            fds_key,
            service_id: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            proxy: None,
            comment: String::new(),
            connected_at: None,
            last_request_at: None,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the HTTPS proxy URL used by the one-shot transport.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets the free-text comment sent with connect and getStatus.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fds_key(&self) -> &FdsKey {
        &self.fds_key
    }

    /// The current serviceID; `None` whenever the session is disconnected.
    pub fn service_id(&self) -> Option<&ServiceId> {
        self.service_id.as_ref()
    }

    /// Derived from the serviceID so the two can never disagree.
    pub fn status(&self) -> ConnectionStatus {
        if self.service_id.is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn connected_at(&self) -> Option<Timestamp> {
        self.connected_at
    }

    pub fn last_request_at(&self) -> Option<Timestamp> {
        self.last_request_at
    }

    /// Records a successful connect.
    pub fn mark_connected(&mut self, service_id: ServiceId, at: Timestamp) {
        self.service_id = Some(service_id);
        self.connected_at = Some(at);
    }

    /// Installs the serviceID the server rotated to on an accepted request.
    pub fn rotate_service_id(&mut self, service_id: ServiceId, at: Timestamp) {
        self.service_id = Some(service_id);
        self.last_request_at = Some(at);
    }

    /// Drops the session: status becomes Disconnected and serviceID empty.
    pub fn mark_disconnected(&mut self) {
        self.service_id = None;
    }
}

/// On-disk shape of [`ConnectionInfo`].
///
/// Explicit `status` is kept for external observers; on load a `Connected`
/// status without a serviceID is read as disconnected.
#[derive(Serialize, Deserialize)]
struct StoredConnectionInfo {
    protocol: Protocol,
    url: String,
    #[serde(rename = "FDSKey")]
    fds_key: FdsKey,
    #[serde(rename = "serviceID", default)]
    service_id: String,
    #[serde(default)]
    status: ConnectionStatus,
    #[serde(rename = "reqTimeout", default = "default_request_timeout_ms")]
    req_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proxy: Option<String>,
    #[serde(default)]
    comment: String,
    #[serde(rename = "cnctTs", default, skip_serializing_if = "Option::is_none")]
    cnct_ts: Option<Timestamp>,
    #[serde(rename = "lastReqTs", default, skip_serializing_if = "Option::is_none")]
    last_req_ts: Option<Timestamp>,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl From<StoredConnectionInfo> for ConnectionInfo {
    fn from(stored: StoredConnectionInfo) -> Self {
        let service_id = match stored.status {
            ConnectionStatus::Connected => ServiceId::new(stored.service_id),
            ConnectionStatus::Disconnected => None,
        };
        Self {
            protocol: stored.protocol,
            url: stored.url,
            fds_key: stored.fds_key,
            service_id,
            request_timeout: Duration::from_millis(stored.req_timeout_ms),
            proxy: stored.proxy,
            comment: stored.comment,
            connected_at: stored.cnct_ts,
            last_request_at: stored.last_req_ts,
        }
    }
}

impl From<ConnectionInfo> for StoredConnectionInfo {
    fn from(info: ConnectionInfo) -> Self {
        let status = info.status();
        Self {
            protocol: info.protocol,
            url: info.url,
            fds_key: info.fds_key,
            service_id: info.service_id.map(String::from).unwrap_or_default(),
            status,
            req_timeout_ms: u64::try_from(info.request_timeout.as_millis()).unwrap_or(u64::MAX),
            proxy: info.proxy,
            comment: info.comment,
            cnct_ts: info.connected_at,
            last_req_ts: info.last_request_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// User credentials supplied at connect time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(username:password)>`, as carried in the duplex connect
    /// request's `Authorization` field.
    pub fn basic_token(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

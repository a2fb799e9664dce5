//! Parsed responses and their validation against the originating request.
//!
//! Validation is the only defence against a response that belongs to a
//! different session (or a stale one): every accepted response must echo the
//! identifiers of the request that produced it. A successful check yields the
//! [`StateUpdate`] the orchestrator applies to [`ConnectionInfo`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    ConnectionInfo, FdsKey, IaCloudError, LogicalRequest, Protocol, ServiceId, Timestamp, FDS_TYPE,
};

/// Response body returned by the remote service.
///
/// Only the echo fields used for validation are typed; everything else is
/// kept in [`Response::extra`] and handed back to the caller untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "serviceID", default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(rename = "newServiceID", default, skip_serializing_if = "Option::is_none")]
    pub new_service_id: Option<String>,
    #[serde(rename = "FDSKey", default, skip_serializing_if = "Option::is_none")]
    pub fds_key: Option<String>,
    #[serde(rename = "FDSType", default, skip_serializing_if = "Option::is_none")]
    pub fds_type: Option<String>,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    /// Parses a response from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IaCloudError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parses a response from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, IaCloudError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Session-side facts a response is checked against, beyond the request.
#[derive(Debug, Clone, Copy)]
pub struct Expectation<'a> {
    pub fds_key: &'a FdsKey,
    /// Username given at connect, if this session knows it.
    pub username: Option<&'a str>,
    pub protocol: Protocol,
}

/// State change implied by an accepted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// A new session was opened with this serviceID.
    Connected(ServiceId),
    /// The server rotated the serviceID.
    Rotated(ServiceId),
    /// The session was closed by the server.
    Terminated,
}

impl StateUpdate {
    /// Applies the update to persisted connection state.
    pub fn apply(self, info: &mut ConnectionInfo, now: Timestamp) {
        match self {
            Self::Connected(service_id) => info.mark_connected(service_id, now),
            Self::Rotated(service_id) => info.rotate_service_id(service_id, now),
            Self::Terminated => info.mark_disconnected(),
        }
    }
}

/// Checks `response` against the request that produced it.
///
/// Returns the state change to apply, or [`IaCloudError::Api`] naming the
/// first inconsistency found.
pub fn validate(
    request: &LogicalRequest,
    response: &Response,
    expect: Expectation<'_>,
) -> Result<StateUpdate, IaCloudError> {
    match request {
        LogicalRequest::Connect { fds_key, .. } => {
            echoed("FDSKey", response.fds_key.as_deref(), fds_key.as_str())?;
            echoed("FDSType", response.fds_type.as_deref(), FDS_TYPE)?;
            let service_id = issued("serviceID", response.service_id.as_deref())?;
            Ok(StateUpdate::Connected(service_id))
        }
        LogicalRequest::GetStatus { service_id, .. } => {
            echoed("serviceID", response.service_id.as_deref(), service_id.as_str())?;
            echoed("FDSKey", response.fds_key.as_deref(), expect.fds_key.as_str())?;
            let next = issued("newServiceID", response.new_service_id.as_deref())?;
            Ok(StateUpdate::Rotated(next))
        }
        LogicalRequest::Store { service_id, .. }
        | LogicalRequest::Retrieve { service_id, .. }
        | LogicalRequest::RetrieveArray { service_id, .. } => {
            echoed("serviceID", response.service_id.as_deref(), service_id.as_str())?;
            let ok = response
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("ok"));
            if !ok {
                debug!(operation = %request.operation(), status = ?response.status, "response rejected");
                return Err(IaCloudError::api(format!(
                    "{} rejected with status {:?}",
                    request.operation(),
                    response.status.as_deref().unwrap_or("<missing>")
                )));
            }
            let next = issued("newServiceID", response.new_service_id.as_deref())?;
            Ok(StateUpdate::Rotated(next))
        }
        LogicalRequest::Terminate { service_id } => {
            // The websocket connect request never carries userID, so the echo
            // is only mandatory for the one-shot dialects.
            match (response.user_id.as_deref(), expect.protocol.is_duplex()) {
                (None, true) => {}
                (user_id, _) => echoed("userID", user_id, expect.username.unwrap_or_default())?,
            }
            echoed("FDSKey", response.fds_key.as_deref(), expect.fds_key.as_str())?;
            echoed("serviceID", response.service_id.as_deref(), service_id.as_str())?;
            Ok(StateUpdate::Terminated)
        }
    }
}

fn echoed(field: &str, actual: Option<&str>, expected: &str) -> Result<(), IaCloudError> {
    match actual {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => {
            debug!(field, expected, actual, "response echo mismatch");
            Err(IaCloudError::api(format!(
                "{field} mismatch: expected {expected:?}, got {actual:?}"
            )))
        }
        None => {
            debug!(field, "response echo missing");
            Err(IaCloudError::api(format!("{field} missing from response")))
        }
    }
}

fn issued(field: &str, value: Option<&str>) -> Result<ServiceId, IaCloudError> {
    value
        .and_then(ServiceId::new)
        .ok_or_else(|| IaCloudError::api(format!("{field} missing from response")))
}

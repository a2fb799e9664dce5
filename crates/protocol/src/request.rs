//! Logical requests and their JSON wire bodies.
//!
//! A [`LogicalRequest`] is built once per operation and reused unchanged by
//! every retry attempt. Transports receive its [`RequestBody`]; the duplex
//! transport adds its correlation `id` to a copy of that body.

use serde_json::{Map, Value};

use crate::{FdsKey, ServiceId, Timestamp};

/// JSON object sent to the remote service.
pub type RequestBody = Map<String, Value>;

/// FDS type announced by the connect request and echoed by the service.
pub const FDS_TYPE: &str = "iaCloudFDS";

/// The six operations the remote service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    GetStatus,
    Store,
    Retrieve,
    RetrieveArray,
    Terminate,
}

impl Operation {
    /// Name carried in the `request` field of the wire body.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::GetStatus => "getStatus",
            Self::Store => "store",
            Self::Retrieve => "retrieve",
            Self::RetrieveArray => "retrieveArray",
            Self::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One logical operation with the fields its validation needs.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalRequest {
    Connect {
        fds_key: FdsKey,
        timestamp: Timestamp,
        comment: String,
        /// Sent by the `REST1` dialect only.
        user_id: Option<String>,
        /// Basic token; sent by the websocket dialect only.
        authorization: Option<String>,
    },
    GetStatus {
        service_id: ServiceId,
        timestamp: Timestamp,
        comment: String,
    },
    Store {
        service_id: ServiceId,
        data_object: Value,
    },
    Retrieve {
        service_id: ServiceId,
        retrieve_object: Value,
    },
    RetrieveArray {
        service_id: ServiceId,
        retrieve_objects: Value,
    },
    Terminate {
        service_id: ServiceId,
    },
}

impl LogicalRequest {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Connect { .. } => Operation::Connect,
            Self::GetStatus { .. } => Operation::GetStatus,
            Self::Store { .. } => Operation::Store,
            Self::Retrieve { .. } => Operation::Retrieve,
            Self::RetrieveArray { .. } => Operation::RetrieveArray,
            Self::Terminate { .. } => Operation::Terminate,
        }
    }

    /// The serviceID the response must echo; `None` for connect.
    pub fn service_id(&self) -> Option<&ServiceId> {
        match self {
            Self::Connect { .. } => None,
            Self::GetStatus { service_id, .. }
            | Self::Store { service_id, .. }
            | Self::Retrieve { service_id, .. }
            | Self::RetrieveArray { service_id, .. }
            | Self::Terminate { service_id } => Some(service_id),
        }
    }

    /// Builds the JSON body for this request.
    pub fn to_body(&self) -> RequestBody {
        let mut body = RequestBody::new();
        body.insert("request".into(), self.operation().name().into());
        match self {
            Self::Connect {
                fds_key,
                timestamp,
                comment,
                user_id,
                authorization,
            } => {
                body.insert("FDSKey".into(), fds_key.as_str().into());
                body.insert("FDSType".into(), FDS_TYPE.into());
                body.insert("timestamp".into(), timestamp.to_string().into());
                body.insert("comment".into(), comment.as_str().into());
                if let Some(user_id) = user_id {
                    body.insert("userID".into(), user_id.as_str().into());
                }
                if let Some(authorization) = authorization {
                    body.insert("Authorization".into(), authorization.as_str().into());
                }
            }
            Self::GetStatus {
                service_id,
                timestamp,
                comment,
            } => {
                body.insert("serviceID".into(), service_id.as_str().into());
                body.insert("timestamp".into(), timestamp.to_string().into());
                body.insert("comment".into(), comment.as_str().into());
            }
            Self::Store {
                service_id,
                data_object,
            } => {
                body.insert("serviceID".into(), service_id.as_str().into());
                body.insert("dataObject".into(), data_object.clone());
            }
            Self::Retrieve {
                service_id,
                retrieve_object,
            } => {
                body.insert("serviceID".into(), service_id.as_str().into());
                body.insert("retrieveObject".into(), retrieve_object.clone());
            }
            Self::RetrieveArray {
                service_id,
                retrieve_objects,
            } => {
                body.insert("serviceID".into(), service_id.as_str().into());
                body.insert("retrieveObjects".into(), retrieve_objects.clone());
            }
            Self::Terminate { service_id } => {
                body.insert("serviceID".into(), service_id.as_str().into());
            }
        }
        body
    }
}

//! Core domain for the ia-cloud connection layer.
//!
//! This crate contains every protocol concept shared by the transports and
//! the orchestrator: identifiers, persisted connection state, logical
//! requests, response validation, request serialization, and the error
//! taxonomy. Infrastructure crates implement the traits defined here; they
//! never add protocol rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`FdsKey`, `ServiceId`, `CorrelationId`) |
//! | [`types`] | `ConnectionInfo`, `Protocol`, `Credentials`, `Timestamp` |
//! | [`request`] | `LogicalRequest` and its JSON body |
//! | [`response`] | `Response` and validation against the request |
//! | [`serializer`] | Payload serialization and file-attachment splicing |
//! | [`ports`] | `Transport` and `ConnectionStore` traits |
//! | [`errors`] | Error taxonomy and retry policy |

pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod request;
pub mod response;
pub mod serializer;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{BoxError, IaCloudError, RetryPolicy};
pub use identifiers::{CorrelationId, FdsKey, ServiceId};
pub use ports::{ConnectionStore, InMemoryConnectionStore, Transport};
pub use request::{LogicalRequest, Operation, RequestBody, FDS_TYPE};
pub use response::{validate, Expectation, Response, StateUpdate};
pub use serializer::{detach_file_path, is_file_data, serialize_request, FILE_CONTENT_MARKER};
pub use types::{
    ConnectionInfo, ConnectionStatus, Credentials, Protocol, Timestamp, DEFAULT_REQUEST_TIMEOUT_MS,
};

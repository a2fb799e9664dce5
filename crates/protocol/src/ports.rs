//! Port traits implemented by the infrastructure crates.
//!
//! The orchestrator talks to the remote service only through [`Transport`]
//! and persists state only through [`ConnectionStore`]. Both are object-safe
//! so the composition root can pick implementations at runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ConnectionInfo, Credentials, IaCloudError, RequestBody, Response};

/// Carries one request body to the remote service and returns its response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `body` (with `attachment` spliced at the file-content marker, if
    /// both are present) and waits for the matching response.
    async fn send(
        &self,
        body: &RequestBody,
        attachment: Option<&[u8]>,
    ) -> Result<Response, IaCloudError>;

    /// Releases the underlying connection, if the transport holds one.
    async fn close(&self) -> Result<(), IaCloudError>;

    /// Supplies credentials for transports that authenticate every call.
    ///
    /// The default does nothing: the duplex transport authenticates inside
    /// the connect request instead.
    fn set_credentials(&self, _credentials: &Credentials) {}
}

/// Key/value store holding one [`ConnectionInfo`] per logical session.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Loads the state stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<ConnectionInfo>, IaCloudError>;

    /// Replaces the state stored under `key`.
    async fn set(&self, key: &str, info: &ConnectionInfo) -> Result<(), IaCloudError>;
}

/// Process-local [`ConnectionStore`].
#[derive(Debug, Default)]
pub struct InMemoryConnectionStore {
    entries: Mutex<HashMap<String, ConnectionInfo>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with `info` under `key`.
    pub fn with_entry(key: impl Into<String>, info: ConnectionInfo) -> Self {
        let store = Self::default();
        store.lock().insert(key.into(), info);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionInfo>> {
        // The map holds plain values; a panic elsewhere cannot leave it torn.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get(&self, key: &str) -> Result<Option<ConnectionInfo>, IaCloudError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, info: &ConnectionInfo) -> Result<(), IaCloudError> {
        self.lock().insert(key.to_owned(), info.clone());
        Ok(())
    }
}

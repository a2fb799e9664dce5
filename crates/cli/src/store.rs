//! JSON-file [`ConnectionStore`].
//!
//! The file holds one object mapping session keys to their stored
//! [`ConnectionInfo`]. Writes go to a sibling temporary file that is then
//! renamed over the original.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use protocol::{ConnectionInfo, ConnectionStore, IaCloudError};
use tokio::sync::Mutex;
use tracing::debug;

type Entries = BTreeMap<String, ConnectionInfo>;

#[derive(Debug)]
pub struct FileConnectionStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileConnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Entries, IaCloudError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Entries::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                IaCloudError::persistence(format!("malformed state file {}", self.path.display()), e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Entries::new()),
            Err(e) => Err(IaCloudError::persistence(
                format!("cannot read {}", self.path.display()),
                e,
            )),
        }
    }

    async fn save(&self, entries: &Entries) -> Result<(), IaCloudError> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| IaCloudError::persistence("cannot encode connection state", e))?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, json).await.map_err(|e| {
            IaCloudError::persistence(format!("cannot write {}", staging.display()), e)
        })?;
        tokio::fs::rename(&staging, &self.path).await.map_err(|e| {
            IaCloudError::persistence(format!("cannot replace {}", self.path.display()), e)
        })
    }
}

#[async_trait]
impl ConnectionStore for FileConnectionStore {
    async fn get(&self, key: &str) -> Result<Option<ConnectionInfo>, IaCloudError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, info: &ConnectionInfo) -> Result<(), IaCloudError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_owned(), info.clone());
        self.save(&entries).await?;
        debug!(key, path = %self.path.display(), status = ?info.status(), "connection state saved");
        Ok(())
    }
}

use std::sync::Arc;

use protocol::{
    detach_file_path, validate, ConnectionInfo, ConnectionStore, Credentials, Expectation,
    IaCloudError, LogicalRequest, Operation, Protocol, Response, RetryPolicy, ServiceId,
    Timestamp, Transport,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::RetrySchedule;

/// Drives the connect / getStatus / store / retrieve / retrieveArray /
/// terminate operations of one logical session.
///
/// Operations on one orchestrator are serialized: each holds the session
/// lock for its whole submit-validate-retry cycle, so the read-modify-write
/// of [`ConnectionInfo`] never interleaves.
pub struct ConnectionOrchestrator {
    store: Arc<dyn ConnectionStore>,
    key: String,
    transport: Arc<dyn Transport>,
    retry: RetrySchedule,
    session: Mutex<Session>,
}

struct Session {
    info: ConnectionInfo,
    /// Username given at connect (or construction); echoed on terminate.
    username: Option<String>,
}

impl ConnectionOrchestrator {
    /// Loads the connection state stored under `key` and binds it to
    /// `transport`.
    ///
    /// `credentials`, when given, are handed to the transport straight away;
    /// one-shot transports need them on every call, not only on connect.
    pub async fn new(
        store: Arc<dyn ConnectionStore>,
        key: impl Into<String>,
        transport: Arc<dyn Transport>,
        credentials: Option<Credentials>,
    ) -> Result<Self, IaCloudError> {
        let key = key.into();
        let info = store.get(&key).await?.ok_or_else(|| {
            IaCloudError::invalid(format!("no connection info stored under '{key}'"))
        })?;
        if let Some(credentials) = &credentials {
            transport.set_credentials(credentials);
        }
        Ok(Self {
            store,
            key,
            transport,
            retry: RetrySchedule::default(),
            session: Mutex::new(Session {
                info,
                username: credentials.map(|c| c.username),
            }),
        })
    }

    pub fn with_retry(mut self, retry: RetrySchedule) -> Self {
        self.retry = retry;
        self
    }

    /// Snapshot of the current connection state.
    pub async fn connection_info(&self) -> ConnectionInfo {
        self.session.lock().await.info.clone()
    }

    /// Opens a logical session. Never retried.
    pub async fn connect(&self, credentials: &Credentials) -> Result<Response, IaCloudError> {
        let mut session = self.session.lock().await;
        self.transport.set_credentials(credentials);
        session.username = Some(credentials.username.clone());

        let protocol = session.info.protocol();
        let request = LogicalRequest::Connect {
            fds_key: session.info.fds_key().clone(),
            timestamp: Timestamp::now(),
            comment: session.info.comment().to_owned(),
            user_id: (protocol == Protocol::Rest1).then(|| credentials.username.clone()),
            authorization: protocol.is_duplex().then(|| credentials.basic_token()),
        };
        self.run(&mut session, request, None).await
    }

    /// Queries the session status and rotates the serviceID.
    pub async fn get_status(&self) -> Result<Response, IaCloudError> {
        let mut session = self.session.lock().await;
        let service_id = require_connected(&session.info, Operation::GetStatus)?;
        let request = LogicalRequest::GetStatus {
            service_id,
            timestamp: Timestamp::now(),
            comment: session.info.comment().to_owned(),
        };
        self.run(&mut session, request, None).await
    }

    /// Stores `data_object`.
    ///
    /// File-data objects have their "file path" entry replaced by the
    /// content placeholder and the file's bytes sent in its place. A
    /// file-data object without a "file path" entry fails before anything is
    /// sent.
    pub async fn store(&self, mut data_object: Value) -> Result<Response, IaCloudError> {
        let mut session = self.session.lock().await;
        let service_id = require_connected(&session.info, Operation::Store)?;
        let attachment = match detach_file_path(&mut data_object)? {
            Some(path) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|source| IaCloudError::Attachment { path, source })?;
                debug!(len = bytes.len(), "file content attached");
                Some(bytes)
            }
            None => None,
        };
        let request = LogicalRequest::Store {
            service_id,
            data_object,
        };
        self.run(&mut session, request, attachment).await
    }

    /// Retrieves one object.
    pub async fn retrieve(&self, retrieve_object: Value) -> Result<Response, IaCloudError> {
        let mut session = self.session.lock().await;
        let service_id = require_connected(&session.info, Operation::Retrieve)?;
        let request = LogicalRequest::Retrieve {
            service_id,
            retrieve_object,
        };
        self.run(&mut session, request, None).await
    }

    /// Retrieves several objects in one request.
    pub async fn retrieve_array(&self, retrieve_objects: Value) -> Result<Response, IaCloudError> {
        let mut session = self.session.lock().await;
        let service_id = require_connected(&session.info, Operation::RetrieveArray)?;
        let request = LogicalRequest::RetrieveArray {
            service_id,
            retrieve_objects,
        };
        self.run(&mut session, request, None).await
    }

    /// Ends the logical session.
    pub async fn terminate(&self) -> Result<Response, IaCloudError> {
        let mut session = self.session.lock().await;
        let service_id = require_connected(&session.info, Operation::Terminate)?;
        let request = LogicalRequest::Terminate { service_id };
        self.run(&mut session, request, None).await
    }

    /// Releases the transport's connection. Session state is left as is.
    pub async fn close(&self) -> Result<(), IaCloudError> {
        self.transport.close().await
    }

    /// Submit, validate and update state; retry the whole cycle on failure.
    #[instrument(
        skip_all,
        fields(operation = %request.operation(), key = %self.key, fds_key = %session.info.fds_key())
    )]
    async fn run(
        &self,
        session: &mut Session,
        request: LogicalRequest,
        attachment: Option<Vec<u8>>,
    ) -> Result<Response, IaCloudError> {
        let operation = request.operation();
        let attempts = match operation {
            Operation::Connect => 1,
            _ => self.retry.max_attempts.max(1),
        };
        let body = request.to_body();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.transport.send(&body, attachment.as_deref()).await {
                Ok(response) => {
                    let expect = Expectation {
                        fds_key: session.info.fds_key(),
                        username: session.username.as_deref(),
                        protocol: session.info.protocol(),
                    };
                    validate(&request, &response, expect).map(|update| (update, response))
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok((update, response)) => {
                    update.apply(&mut session.info, Timestamp::now());
                    self.persist(&session.info).await?;
                    info!(attempt, status = ?session.info.status(), "request accepted");
                    return Ok(response);
                }
                Err(err) => {
                    session.info.mark_disconnected();
                    self.persist(&session.info).await?;

                    let pause = match err.retry_policy() {
                        RetryPolicy::Retryable { after } if attempt < attempts => {
                            after.unwrap_or(self.retry.delay)
                        }
                        _ => {
                            warn!(attempt, code = err.code(), error = %err, "request failed");
                            return Err(err);
                        }
                    };
                    warn!(attempt, attempts, code = err.code(), error = %err, "attempt failed; retrying");
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    async fn persist(&self, info: &ConnectionInfo) -> Result<(), IaCloudError> {
        self.store.set(&self.key, info).await
    }
}

fn require_connected(info: &ConnectionInfo, operation: Operation) -> Result<ServiceId, IaCloudError> {
    info.service_id().cloned().ok_or_else(|| {
        IaCloudError::invalid(format!("{operation} requires a connected session"))
    })
}

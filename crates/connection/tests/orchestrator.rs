//! Orchestrator behaviour against a scripted transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connection::{ConnectionOrchestrator, RetrySchedule};
use protocol::{
    ConnectionInfo, ConnectionStatus, ConnectionStore, Credentials, FdsKey, IaCloudError,
    InMemoryConnectionStore, Protocol, RequestBody, Response, ServiceId, Timestamp, Transport,
    FILE_CONTENT_MARKER,
};
use serde_json::{json, Value};
use tokio::time::Instant;

const KEY: &str = "line-3";

/// Transport that replays a fixed list of outcomes and records what it sent.
#[derive(Default)]
struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Result<Response, IaCloudError>>>,
    sent: Mutex<Vec<(RequestBody, Option<Vec<u8>>)>>,
    credentials: Mutex<Option<Credentials>>,
}

impl ScriptedTransport {
    fn replying(outcomes: Vec<Result<Value, IaCloudError>>) -> Arc<Self> {
        let outcomes = outcomes
            .into_iter()
            .map(|o| o.map(|v| Response::from_value(v).unwrap()))
            .collect();
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            ..Self::default()
        })
    }

    fn sent(&self) -> Vec<(RequestBody, Option<Vec<u8>>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        body: &RequestBody,
        attachment: Option<&[u8]>,
    ) -> Result<Response, IaCloudError> {
        self.sent
            .lock()
            .unwrap()
            .push((body.clone(), attachment.map(<[u8]>::to_vec)));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(IaCloudError::lower("script exhausted")))
    }

    async fn close(&self) -> Result<(), IaCloudError> {
        Ok(())
    }

    fn set_credentials(&self, credentials: &Credentials) {
        *self.credentials.lock().unwrap() = Some(credentials.clone());
    }
}

/// Store that keeps every version written to it.
#[derive(Default)]
struct RecordingStore {
    inner: InMemoryConnectionStore,
    writes: Mutex<Vec<ConnectionInfo>>,
}

impl RecordingStore {
    fn seeded(info: ConnectionInfo) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryConnectionStore::with_entry(KEY, info),
            writes: Mutex::default(),
        })
    }

    fn writes(&self) -> Vec<ConnectionInfo> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<ConnectionInfo>, IaCloudError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, info: &ConnectionInfo) -> Result<(), IaCloudError> {
        self.writes.lock().unwrap().push(info.clone());
        self.inner.set(key, info).await
    }
}

/// Store whose writes always fail.
struct ReadOnlyStore(InMemoryConnectionStore);

#[async_trait]
impl ConnectionStore for ReadOnlyStore {
    async fn get(&self, key: &str) -> Result<Option<ConnectionInfo>, IaCloudError> {
        self.0.get(key).await
    }

    async fn set(&self, _key: &str, _info: &ConnectionInfo) -> Result<(), IaCloudError> {
        Err(IaCloudError::persistence(
            "state file is read-only",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        ))
    }
}

fn disconnected(protocol: Protocol) -> ConnectionInfo {
    ConnectionInfo::new(protocol, "https://ccs.example/api", FdsKey::new("K1").unwrap())
        .with_comment("press 7")
}

fn connected(service_id: &str) -> ConnectionInfo {
    let mut info = disconnected(Protocol::Rest2);
    info.mark_connected(ServiceId::new(service_id).unwrap(), Timestamp::now());
    info
}

fn alice() -> Credentials {
    Credentials::new("alice", "s3cret")
}

async fn orchestrator(
    store: Arc<RecordingStore>,
    transport: Arc<ScriptedTransport>,
) -> ConnectionOrchestrator {
    ConnectionOrchestrator::new(store, KEY, transport, Some(alice()))
        .await
        .unwrap()
}

#[tokio::test]
async fn connect_installs_service_id_and_persists() {
    let store = RecordingStore::seeded(disconnected(Protocol::Rest2));
    let transport = ScriptedTransport::replying(vec![Ok(json!({
        "FDSKey": "K1", "FDSType": "iaCloudFDS", "serviceID": "S1"
    }))]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    orch.connect(&alice()).await.unwrap();

    let info = orch.connection_info().await;
    assert_eq!(info.status(), ConnectionStatus::Connected);
    assert_eq!(info.service_id().map(ServiceId::as_str), Some("S1"));
    assert!(info.connected_at().is_some());
    assert_eq!(store.writes().last(), Some(&info));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let body = &sent[0].0;
    assert_eq!(body["request"], "connect");
    assert_eq!(body["FDSKey"], "K1");
    assert_eq!(body["comment"], "press 7");
    assert!(!body.contains_key("userID"));
    assert!(!body.contains_key("Authorization"));
}

#[tokio::test(start_paused = true)]
async fn connect_is_attempted_exactly_once() {
    let store = RecordingStore::seeded(disconnected(Protocol::Rest2));
    let transport = ScriptedTransport::replying(vec![Err(IaCloudError::lower("refused"))]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    let err = orch.connect(&alice()).await.unwrap_err();

    assert!(matches!(err, IaCloudError::LowerProtocol { .. }), "{err:?}");
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(store.writes().len(), 1);
    assert_eq!(orch.connection_info().await.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn connect_body_follows_protocol_dialect() {
    let reply = json!({"FDSKey": "K1", "FDSType": "iaCloudFDS", "serviceID": "S1"});

    let rest1 = ScriptedTransport::replying(vec![Ok(reply.clone())]);
    let orch = orchestrator(RecordingStore::seeded(disconnected(Protocol::Rest1)), rest1.clone()).await;
    orch.connect(&alice()).await.unwrap();
    let body = &rest1.sent()[0].0;
    assert_eq!(body["userID"], "alice");
    assert!(!body.contains_key("Authorization"));

    let duplex = ScriptedTransport::replying(vec![Ok(reply)]);
    let orch = orchestrator(RecordingStore::seeded(disconnected(Protocol::Websocket)), duplex.clone()).await;
    orch.connect(&alice()).await.unwrap();
    let body = &duplex.sent()[0].0;
    assert_eq!(body["Authorization"], "Basic YWxpY2U6czNjcmV0");
    assert!(!body.contains_key("userID"));
}

#[tokio::test]
async fn credentials_reach_the_transport() {
    let transport = ScriptedTransport::replying(vec![]);
    let _orch = orchestrator(RecordingStore::seeded(connected("S1")), transport.clone()).await;
    assert_eq!(*transport.credentials.lock().unwrap(), Some(alice()));
}

#[tokio::test]
async fn get_status_rotates_service_id() {
    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![Ok(json!({
        "serviceID": "S1", "FDSKey": "K1", "newServiceID": "S2"
    }))]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    orch.get_status().await.unwrap();

    let info = orch.connection_info().await;
    assert_eq!(info.service_id().map(ServiceId::as_str), Some("S2"));
    assert!(info.last_request_at().is_some());
    assert_eq!(transport.sent()[0].0["serviceID"], "S1");
    assert_eq!(store.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn foreign_service_id_fails_after_three_spaced_attempts() {
    let store = RecordingStore::seeded(connected("S1"));
    let foreign = json!({"serviceID": "S9", "FDSKey": "K1", "newServiceID": "S2"});
    let transport = ScriptedTransport::replying(vec![
        Ok(foreign.clone()),
        Ok(foreign.clone()),
        Ok(foreign),
    ]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    let started = Instant::now();
    let err = orch.get_status().await.unwrap_err();

    assert!(matches!(err, IaCloudError::Api { .. }), "{err:?}");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(transport.sent().len(), 3);
    // Every retry reuses the original request.
    assert!(transport.sent().iter().all(|(body, _)| body["serviceID"] == "S1"));
    assert_eq!(store.writes().len(), 3, "state is persisted after every attempt");
    assert!(store
        .writes()
        .iter()
        .all(|info| info.status() == ConnectionStatus::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_a_transient_failure() {
    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![
        Err(IaCloudError::Timeout {
            after: Duration::from_secs(5),
        }),
        Ok(json!({"serviceID": "S1", "status": "ok", "newServiceID": "S2"})),
    ]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    orch.retrieve(json!({"objectKey": "temp"})).await.unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].status(), ConnectionStatus::Disconnected);
    assert_eq!(writes[1].service_id().map(ServiceId::as_str), Some("S2"));
    assert_eq!(transport.sent()[1].0["retrieveObject"], json!({"objectKey": "temp"}));
}

#[tokio::test(start_paused = true)]
async fn custom_retry_schedule_is_honoured() {
    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![]);
    let orch = orchestrator(store, transport.clone()).await.with_retry(RetrySchedule {
        max_attempts: 5,
        delay: Duration::from_millis(100),
    });

    let started = Instant::now();
    orch.retrieve_array(json!([])).await.unwrap_err();

    assert_eq!(transport.sent().len(), 5);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400) && elapsed < Duration::from_secs(1));
}

#[tokio::test]
async fn store_rejects_non_ok_status() {
    let store = RecordingStore::seeded(connected("S1"));
    let rejected = json!({"serviceID": "S1", "status": "ng", "newServiceID": "S2"});
    let transport = ScriptedTransport::replying(vec![Ok(rejected.clone()), Ok(rejected.clone()), Ok(rejected)]);
    let orch = orchestrator(store, transport)
        .await
        .with_retry(RetrySchedule {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        });

    let err = orch.store(json!({"objectKey": "temp"})).await.unwrap_err();
    assert!(matches!(err, IaCloudError::Api { .. }), "{err:?}");
}

#[tokio::test]
async fn operations_require_a_connected_session() {
    let store = RecordingStore::seeded(disconnected(Protocol::Rest2));
    let transport = ScriptedTransport::replying(vec![]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    let results = [
        orch.get_status().await,
        orch.store(json!({})).await,
        orch.retrieve(json!({})).await,
        orch.retrieve_array(json!([])).await,
        orch.terminate().await,
    ];

    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, IaCloudError::InvalidRequest { .. }), "{err:?}");
    }
    assert!(transport.sent().is_empty());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn file_data_without_path_is_rejected_before_sending() {
    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    let object = json!({
        "objectType": "iaCloudObject",
        "objectKey": "camera-1",
        "objectContent": {
            "contentType": "Filedata",
            "contentData": [{"commonName": "file name", "dataValue": "a.png"}]
        }
    });
    let err = orch.store(object).await.unwrap_err();

    match err {
        IaCloudError::InvalidRequest { reason } => assert_eq!(reason, "no file path"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(transport.sent().is_empty());
    assert_eq!(orch.connection_info().await.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn file_data_is_sent_with_its_content_attached() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"\x89PNG raw").unwrap();

    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![Ok(json!({
        "serviceID": "S1", "status": "OK", "newServiceID": "S2"
    }))]);
    let orch = orchestrator(store, transport.clone()).await;

    let object = json!({
        "objectType": "iaCloudObject",
        "objectKey": "camera-1",
        "objectContent": {
            "contentType": "Filedata",
            "contentData": [
                {"commonName": "file name", "dataValue": "a.png"},
                {"commonName": "file path", "dataValue": file.path().to_str().unwrap()}
            ]
        }
    });
    orch.store(object).await.unwrap();

    let (body, attachment) = &transport.sent()[0];
    assert_eq!(attachment.as_deref(), Some(&b"\x89PNG raw"[..]));
    let entries = body["dataObject"]["objectContent"]["contentData"]
        .as_array()
        .unwrap();
    assert!(entries.iter().all(|e| e["commonName"] != "file path"));
    assert_eq!(
        entries.last().unwrap(),
        &json!({"commonName": "Encoded data", "dataValue": FILE_CONTENT_MARKER})
    );
}

#[tokio::test]
async fn unreadable_attachment_is_not_retried() {
    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![]);
    let orch = orchestrator(store, transport.clone()).await;

    let object = json!({
        "objectType": "iaCloudObject",
        "objectContent": {
            "contentType": "Filedata",
            "contentData": [{"commonName": "file path", "dataValue": "/nonexistent/a.png"}]
        }
    });
    let err = orch.store(object).await.unwrap_err();

    assert!(matches!(err, IaCloudError::Attachment { .. }), "{err:?}");
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn terminate_disconnects_the_session() {
    let store = RecordingStore::seeded(connected("S1"));
    let transport = ScriptedTransport::replying(vec![Ok(json!({
        "userID": "alice", "FDSKey": "K1", "serviceID": "S1"
    }))]);
    let orch = orchestrator(store.clone(), transport.clone()).await;

    orch.terminate().await.unwrap();

    let info = orch.connection_info().await;
    assert_eq!(info.status(), ConnectionStatus::Disconnected);
    assert!(info.service_id().is_none());
    assert_eq!(store.writes().last(), Some(&info));
    assert_eq!(transport.sent()[0].0["request"], "terminate");
}

#[tokio::test]
async fn persistence_failure_surfaces_immediately() {
    let inner = InMemoryConnectionStore::with_entry(KEY, connected("S1"));
    let transport = ScriptedTransport::replying(vec![Err(IaCloudError::lower("refused"))]);
    let orch = ConnectionOrchestrator::new(Arc::new(ReadOnlyStore(inner)), KEY, transport.clone(), None)
        .await
        .unwrap();

    let err = orch.get_status().await.unwrap_err();

    assert!(matches!(err, IaCloudError::Persistence { .. }), "{err:?}");
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn missing_connection_info_is_rejected() {
    let store: Arc<dyn ConnectionStore> = Arc::new(InMemoryConnectionStore::new());
    let transport = ScriptedTransport::replying(vec![]);
    let err = ConnectionOrchestrator::new(store, "absent", transport, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, IaCloudError::InvalidRequest { .. }), "{err:?}");
}

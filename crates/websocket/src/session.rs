//! The duplex session: one websocket shared by many concurrent requests.
//!
//! ```text
//!  submit ──► PendingTable.register ──► outbound mpsc ──► writer task ──► sink
//!     ▲                                                                  │
//!     └──── oneshot ◄── PendingTable.resolve ◄── reader task ◄── stream ◄┘
//! ```
//!
//! The reader task owns the stream half, the writer task owns the sink half;
//! callers only ever hold a clone of the outbound sender. Each connection has
//! its own pending table. When the reader sees its connection end it rejects
//! what is pending on that connection only and, unless the close was
//! requested, starts a bounded reconnect sequence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use protocol::{
    serialize_request, CorrelationId, IaCloudError, RequestBody, Response, Transport,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::pending::PendingTable;
use crate::DuplexConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the peer to acknowledge the close handshake.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Field carrying the correlation id in both directions.
const ID_FIELD: &str = "id";

/// A persistent websocket multiplexing many logical requests.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct DuplexSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: DuplexConfig,
    state: Mutex<LinkState>,
    /// The installed link's liveness flag and pending table, readable
    /// without the state lock.
    current: std::sync::Mutex<Published>,
    /// Bumped after every completed reconnect sequence. Read without the
    /// lock so a waiter can tell whether a sequence ran while it waited.
    reconnects: AtomicU64,
}

#[derive(Default)]
struct LinkState {
    link: Option<Link>,
    last_reconnect_failed: bool,
    closing: bool,
}

/// One websocket connection and the requests waiting on it.
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn route(&self) -> Route {
        Route {
            outbound: self.outbound.clone(),
            pending: Arc::clone(&self.pending),
        }
    }

    fn published(&self) -> Published {
        Published {
            alive: Arc::clone(&self.alive),
            pending: Some(Arc::clone(&self.pending)),
        }
    }

    /// Stops a replaced link's reader and fails whatever still waits on it.
    fn retire(self) {
        self.reader.abort();
        let rejected = self
            .pending
            .reject_all(|| IaCloudError::lower("connection closed"));
        if rejected > 0 {
            debug!(rejected, "requests on a replaced connection rejected");
        }
    }
}

/// Where a submission goes: the link's writer and its pending table.
struct Route {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingTable>,
}

#[derive(Default)]
struct Published {
    alive: Arc<AtomicBool>,
    pending: Option<Arc<PendingTable>>,
}

/// Who is asking for a usable link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A caller submitting a request.
    Caller,
    /// The reader task after an unexpected closure.
    Supervisor,
}

impl DuplexSession {
    /// Creates a session; no connection is made until [`open`](Self::open)
    /// or the first submission.
    pub fn new(config: DuplexConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(LinkState::default()),
                current: std::sync::Mutex::new(Published::default()),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.shared.config
    }

    /// Establishes the websocket. Returns immediately if it is already open.
    #[instrument(skip_all, fields(endpoint = %self.shared.config.endpoint))]
    pub async fn open(&self) -> Result<(), IaCloudError> {
        let mut state = self.shared.state.lock().await;
        if state.link.as_ref().is_some_and(Link::is_alive) {
            return Ok(());
        }
        state.closing = false;
        let link = Shared::establish(&self.shared).await?;
        self.shared.install(&mut state, Some(link));
        info!("websocket open");
        Ok(())
    }

    /// Returns `true` while the websocket is up. Never waits on a
    /// reconnect in progress.
    pub fn is_connected(&self) -> bool {
        self.shared.published().alive.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a response on the current connection.
    pub fn pending_requests(&self) -> usize {
        self.shared
            .published()
            .pending
            .as_deref()
            .map_or(0, PendingTable::len)
    }

    /// Sends `body` under a fresh correlation id and waits for the response
    /// carrying that id.
    ///
    /// `timeout` bounds the whole exchange, including any wait for a
    /// reconnect in progress. On expiry the request leaves the pending table
    /// and a late response for it is discarded.
    pub async fn submit(
        &self,
        body: &RequestBody,
        attachment: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Response, IaCloudError> {
        match tokio::time::timeout(timeout, self.exchange(body, attachment)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(?timeout, "request timed out");
                Err(IaCloudError::Timeout { after: timeout })
            }
        }
    }

    async fn exchange(
        &self,
        body: &RequestBody,
        attachment: Option<&[u8]>,
    ) -> Result<Response, IaCloudError> {
        let observed = self.shared.reconnects.load(Ordering::SeqCst);
        let Route { outbound, pending } =
            Shared::ensure_link(&self.shared, observed, Trigger::Caller).await?;

        let (guard, completion) = pending.register();
        let mut message = body.clone();
        message.insert(ID_FIELD.into(), Value::String(guard.id().to_string()));
        let payload = serialize_request(&message, attachment)?;
        let frame = match String::from_utf8(payload) {
            Ok(text) => Message::text(text),
            Err(not_utf8) => Message::binary(not_utf8.into_bytes()),
        };
        debug!(id = %guard.id(), request = ?body.get("request"), "submitting");

        outbound
            .send(frame)
            .map_err(|_| IaCloudError::lower("connection closed before the request was sent"))?;
        drop(outbound);

        let outcome = completion
            .await
            .map_err(|_| IaCloudError::lower("session dropped while waiting for a response"))?;
        drop(guard);
        outcome
    }

    /// Closes the websocket and waits for the peer to acknowledge.
    ///
    /// Requests still pending are rejected by the reader as the connection
    /// ends. No reconnection follows a requested close; a later submission
    /// opens a new connection.
    #[instrument(skip_all, fields(endpoint = %self.shared.config.endpoint))]
    pub async fn close(&self) -> Result<(), IaCloudError> {
        let link = {
            let mut state = self.shared.state.lock().await;
            state.closing = true;
            let link = state.link.take();
            self.shared.install(&mut state, None);
            link
        };
        let Some(Link {
            outbound,
            pending,
            reader,
            ..
        }) = link
        else {
            return Ok(());
        };

        // The writer stops after forwarding the close frame. A send error
        // means the writer is already gone.
        let _ = outbound.send(Message::Close(None));
        let abort = reader.abort_handle();
        match tokio::time::timeout(CLOSE_ACK_TIMEOUT, reader).await {
            Ok(_) => {
                info!("websocket closed");
                Ok(())
            }
            Err(_) => {
                abort.abort();
                pending.reject_all(|| IaCloudError::lower("connection closed"));
                Err(IaCloudError::lower("close was not acknowledged"))
            }
        }
    }
}

impl Shared {
    fn published(&self) -> std::sync::MutexGuard<'_, Published> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Replaces the installed link and republishes its state. A link being
    /// replaced is retired.
    fn install(&self, state: &mut LinkState, link: Option<Link>) {
        *self.published() = link.as_ref().map(Link::published).unwrap_or_default();
        if let Some(replaced) = std::mem::replace(&mut state.link, link) {
            replaced.retire();
        }
    }

    /// Opens one websocket and starts its reader and writer tasks.
    ///
    /// Boxed: the reader it spawns may reconnect, which comes back here.
    fn establish(shared: &Arc<Shared>) -> BoxFuture<'_, Result<Link, IaCloudError>> {
        async move {
            let (stream, _) = connect_async(shared.config.endpoint.as_str())
                .await
                .map_err(|err| IaCloudError::lower_with("can't open connection", err))?;
            let (sink, stream) = stream.split();
            let (outbound, rx) = mpsc::unbounded_channel();
            let alive = Arc::new(AtomicBool::new(true));
            let pending = Arc::new(PendingTable::default());

            tokio::spawn(write_loop(sink, rx, Arc::clone(&alive)));
            let reader = tokio::spawn(read_loop(
                stream,
                Arc::clone(&pending),
                Arc::downgrade(shared),
                Arc::clone(&alive),
            ));
            Ok(Link {
                outbound,
                pending,
                alive,
                reader,
            })
        }
        .boxed()
    }

    /// Returns the route to a live link, reconnecting if necessary.
    ///
    /// Only one reconnect sequence runs at a time. A waiter that finds a
    /// sequence completed (and failed) while it waited gets that failure
    /// instead of starting another.
    async fn ensure_link(
        shared: &Arc<Shared>,
        observed: u64,
        trigger: Trigger,
    ) -> Result<Route, IaCloudError> {
        let mut state = shared.state.lock().await;
        if let Some(link) = state.link.as_ref().filter(|link| link.is_alive()) {
            return Ok(link.route());
        }
        match trigger {
            Trigger::Supervisor if state.closing => {
                return Err(IaCloudError::lower("session closed"));
            }
            Trigger::Caller => state.closing = false,
            Trigger::Supervisor => {}
        }
        if shared.reconnects.load(Ordering::SeqCst) != observed && state.last_reconnect_failed {
            return Err(IaCloudError::lower("can't open connection"));
        }

        let outcome = Shared::reconnect(shared).await;
        state.last_reconnect_failed = outcome.is_err();
        shared.reconnects.fetch_add(1, Ordering::SeqCst);

        let link = outcome?;
        let route = link.route();
        shared.install(&mut state, Some(link));
        Ok(route)
    }

    /// Bounded reconnect: `reconnect_attempts` tries spaced evenly over
    /// `reconnect_window`.
    async fn reconnect(shared: &Arc<Shared>) -> Result<Link, IaCloudError> {
        let attempts = shared.config.reconnect_attempts.max(1);
        let spacing = shared.config.reconnect_window / attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let started = Instant::now();
            match tokio::time::timeout(spacing, Shared::establish(shared)).await {
                Ok(Ok(link)) => {
                    info!(attempt, "websocket re-established");
                    return Ok(link);
                }
                Ok(Err(err)) => {
                    warn!(attempt, attempts, error = %err, "reconnect attempt failed");
                    last_error = Some(err);
                }
                Err(_) => warn!(attempt, attempts, "reconnect attempt timed out"),
            }
            if attempt < attempts {
                tokio::time::sleep_until(started + spacing).await;
            }
        }

        Err(IaCloudError::LowerProtocol {
            message: "can't open connection".into(),
            source: last_error.map(Into::into),
        })
    }
}

/// Routes one inbound message to the caller waiting on this connection.
fn dispatch(pending: &PendingTable, raw: &[u8]) {
    let mut value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "discarding unparseable message");
            return;
        }
    };
    let id = value
        .as_object_mut()
        .and_then(|object| object.remove(ID_FIELD))
        .and_then(|id| id.as_str().and_then(CorrelationId::parse));
    let Some(id) = id else {
        warn!("discarding message without a correlation id");
        return;
    };

    if !pending.resolve(id, Response::from_value(value)) {
        debug!(%id, "discarding response with no pending request");
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    alive: Arc<AtomicBool>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            warn!(error = %err, "websocket write failed");
            alive.store(false, Ordering::SeqCst);
            return;
        }
        if closing {
            return;
        }
    }
    // All senders gone: the session was dropped without closing.
    if let Err(err) = sink.close().await {
        debug!(error = %err, "close handshake failed");
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: Arc<PendingTable>,
    shared: Weak<Shared>,
    alive: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch(&pending, text.as_str().as_bytes()),
            Ok(Message::Binary(bytes)) => dispatch(&pending, &bytes),
            Ok(Message::Close(frame)) => debug!(?frame, "peer sent close"),
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "websocket read failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    let rejected = pending.reject_all(|| IaCloudError::lower("connection closed"));
    info!(rejected, "websocket connection ended");

    let Some(session) = shared.upgrade() else {
        return;
    };

    let observed = session.reconnects.load(Ordering::SeqCst);
    tokio::spawn(async move {
        if let Err(err) = Shared::ensure_link(&session, observed, Trigger::Supervisor).await {
            debug!(error = %err, "background reconnect gave up");
        }
    });
}

#[async_trait::async_trait]
impl Transport for DuplexSession {
    async fn send(
        &self,
        body: &RequestBody,
        attachment: Option<&[u8]>,
    ) -> Result<Response, IaCloudError> {
        self.submit(body, attachment, self.shared.config.request_timeout)
            .await
    }

    async fn close(&self) -> Result<(), IaCloudError> {
        DuplexSession::close(self).await
    }
}

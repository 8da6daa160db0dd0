//! Control link client: connection lifecycle and socket worker.
//!
//! `LinkClient::connect` opens a TCP stream to the device and spawns a
//! background worker that owns it. The worker writes queued tokens, feeds
//! every read into a [`FrameSplitter`] and hands decoded messages to the
//! client's [`MessageRouter`]. When the socket closes for any reason the
//! client moves back to [`LinkState::Disconnected`] and every pending request
//! fails with [`LinkError::ConnectionClosed`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::correlator::RequestCorrelator;
use crate::link::frame::FrameSplitter;
use crate::link::proto::TransactionId;
use crate::link::router::{MessageRouter, Subscription};
use crate::link::token::Token;

/// Default values for [`LinkClientOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkDefaults;

impl LinkDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const MAX_FRAME_LEN: usize = 1024 * 1024;
    pub const READ_BUFFER_LEN: usize = 8 * 1024;
}

/// Device endpoint to connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tunables for a [`LinkClient`].
#[derive(Clone, Debug)]
pub struct LinkClientOptions {
    /// How long a request waits for its correlated response.
    pub request_timeout: Duration,
    /// Upper bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for the close notification before the
    /// worker is aborted.
    pub close_timeout: Duration,
    /// Largest object the frame splitter buffers before discarding it.
    pub max_frame_len: usize,
    /// Size of each socket read.
    pub read_buffer_len: usize,
}

impl Default for LinkClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: LinkDefaults::REQUEST_TIMEOUT,
            connect_timeout: LinkDefaults::CONNECT_TIMEOUT,
            close_timeout: LinkDefaults::CLOSE_TIMEOUT,
            max_frame_len: LinkDefaults::MAX_FRAME_LEN,
            read_buffer_len: LinkDefaults::READ_BUFFER_LEN,
        }
    }
}

impl LinkClientOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_read_buffer_len(mut self, len: usize) -> Self {
        self.read_buffer_len = len.max(1);
        self
    }
}

/// Connection lifecycle as seen by callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outcome of closing a connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CloseReport {
    /// True when the socket ended with an I/O error.
    pub had_error: bool,
    /// True when the peer did not finish closing within the close timeout and
    /// the connection was torn down.
    pub timed_out: bool,
}

impl CloseReport {
    fn failed() -> Self {
        Self {
            had_error: true,
            timed_out: false,
        }
    }

    /// Whether the socket closed on both sides without error.
    pub fn is_clean(&self) -> bool {
        !self.had_error && !self.timed_out
    }
}

/// Errors produced by the control link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The TCP connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connection was not established within the connect timeout.
    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    /// A connection attempt is already in flight.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// The client is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// The operation needs an established connection.
    #[error("not connected")]
    NotConnected,

    /// No correlated response arrived within the request timeout.
    #[error("request {transaction_id} timed out")]
    Timeout { transaction_id: TransactionId },

    /// Another request with the same transaction id is still pending.
    #[error("transaction id {transaction_id} is already pending")]
    DuplicateTransaction { transaction_id: TransactionId },

    /// The connection closed before the response arrived.
    #[error("connection closed before request {transaction_id} completed")]
    ConnectionClosed { transaction_id: TransactionId },

    /// Token serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client end of the control link.
///
/// Cheap to clone; clones share one connection, one pending-request table and
/// one set of stream subscriptions.
#[derive(Clone, Debug)]
pub struct LinkClient {
    options: LinkClientOptions,
    shared: Arc<Shared>,
    correlator: RequestCorrelator,
}

#[derive(Debug)]
struct Shared {
    connection: Mutex<Connection>,
    router: Arc<MessageRouter>,
    state_tx: watch::Sender<LinkState>,
    next_connection_id: AtomicU64,
    dropped_frames: AtomicU64,
}

#[derive(Debug)]
enum Connection {
    Disconnected,
    Connecting,
    Connected(ActiveConnection),
}

impl Connection {
    fn state(&self) -> LinkState {
        match self {
            Connection::Disconnected => LinkState::Disconnected,
            Connection::Connecting => LinkState::Connecting,
            Connection::Connected(_) => LinkState::Connected,
        }
    }
}

#[derive(Debug)]
struct ActiveConnection {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<CloseReport>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swaps the connection and publishes the new state while the lock is
    /// held, so observers never see transitions out of order.
    fn replace(&self, guard: &mut Connection, next: Connection) -> Connection {
        let previous = std::mem::replace(guard, next);
        self.state_tx.send_replace(guard.state());
        previous
    }

    /// Takes down the current connection.
    ///
    /// Requests only register while connected, so every pending entry belongs
    /// to the connection being replaced and fails here, before a later
    /// `connect` can start registering again.
    fn take_connected(&self, guard: &mut Connection) -> Option<ActiveConnection> {
        if !matches!(guard, Connection::Connected(_)) {
            return None;
        }
        let previous = self.replace(guard, Connection::Disconnected);
        self.router.fail_pending();
        match previous {
            Connection::Connected(active) => Some(active),
            _ => None,
        }
    }

    /// Called by a worker whose socket has ended.
    fn connection_ended(&self, id: u64, report: CloseReport) {
        let mut guard = self.lock();
        let current = matches!(&*guard, Connection::Connected(active) if active.id == id);
        if current && self.take_connected(&mut guard).is_some() {
            info!(
                event = "link_disconnected",
                connection_id = id,
                had_error = report.had_error
            );
        }
    }
}

impl Default for LinkClient {
    fn default() -> Self {
        Self::new(LinkClientOptions::default())
    }
}

impl LinkClient {
    pub fn new(options: LinkClientOptions) -> Self {
        let router = Arc::new(MessageRouter::new());
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let correlator = RequestCorrelator::new(Arc::clone(&router), options.request_timeout);
        Self {
            options,
            shared: Arc::new(Shared {
                connection: Mutex::new(Connection::Disconnected),
                router,
                state_tx,
                next_connection_id: AtomicU64::new(1),
                dropped_frames: AtomicU64::new(0),
            }),
            correlator,
        }
    }

    pub fn options(&self) -> &LinkClientOptions {
        &self.options
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.router.pending_requests()
    }

    /// Frames dropped because they failed to decode, across all connections.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Subscribes to unsolicited messages tagged with `response_type`.
    ///
    /// Subscriptions outlive individual connections.
    pub fn subscribe(&self, response_type: impl Into<String>) -> Subscription {
        self.shared.router.subscribe(response_type)
    }

    /// Connects to the device.
    ///
    /// Fails fast with [`LinkError::AlreadyConnecting`] or
    /// [`LinkError::AlreadyConnected`] instead of queueing a second attempt.
    pub async fn connect(&self, target: &ConnectOptions) -> Result<(), LinkError> {
        {
            let mut guard = self.shared.lock();
            match guard.state() {
                LinkState::Connecting => {
                    warn!(event = "link_connect_ignored", state = "connecting");
                    return Err(LinkError::AlreadyConnecting);
                }
                LinkState::Connected => {
                    warn!(event = "link_connect_ignored", state = "connected");
                    return Err(LinkError::AlreadyConnected);
                }
                LinkState::Disconnected => {
                    self.shared.replace(&mut guard, Connection::Connecting);
                }
            }
        }

        let attempt = ConnectAttempt {
            shared: self.shared.as_ref(),
            armed: true,
        };
        let addr = target.addr();
        debug!(event = "link_connecting", addr = %addr);

        let stream = match tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                warn!(event = "link_connect_failed", addr = %addr, error = %source);
                return Err(LinkError::Connect { addr, source });
            }
            Err(_) => {
                warn!(event = "link_connect_timed_out", addr = %addr);
                return Err(LinkError::ConnectTimeout { addr });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(event = "link_nodelay_failed", error = %err);
        }

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut guard = self.shared.lock();
        let worker = tokio::spawn(link_connection_worker(
            id,
            stream,
            outbound_rx,
            shutdown_rx,
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.router),
            self.options.clone(),
        ));
        self.shared.replace(
            &mut guard,
            Connection::Connected(ActiveConnection {
                id,
                outbound: outbound_tx,
                shutdown: shutdown_tx,
                worker,
            }),
        );
        attempt.disarm();
        info!(event = "link_connected", addr = %addr, connection_id = id);
        Ok(())
    }

    /// Closes the connection and waits for the socket to finish closing.
    ///
    /// Resolves immediately when not connected.
    pub async fn disconnect(&self) -> CloseReport {
        let active = {
            let mut guard = self.shared.lock();
            match self.shared.take_connected(&mut guard) {
                Some(active) => active,
                None => return CloseReport::default(),
            }
        };

        let ActiveConnection {
            id,
            outbound,
            shutdown,
            mut worker,
        } = active;
        drop(outbound);
        let _ = shutdown.send(());

        let report = match tokio::time::timeout(self.options.close_timeout, &mut worker).await {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                warn!(event = "link_worker_failed", connection_id = id, error = %err);
                CloseReport::failed()
            }
            Err(_) => {
                worker.abort();
                warn!(
                    event = "link_close_timed_out",
                    connection_id = id,
                    timeout_ms = self.options.close_timeout.as_millis() as u64
                );
                CloseReport {
                    had_error: false,
                    timed_out: true,
                }
            }
        };

        info!(
            event = "link_disconnected",
            connection_id = id,
            had_error = report.had_error,
            timed_out = report.timed_out
        );
        report
    }

    /// Sends `token` and waits for the response with the same transaction id.
    ///
    /// Fails with [`LinkError::NotConnected`] without touching the socket when
    /// the link is down, and with [`LinkError::Timeout`] when the device stays
    /// silent past the request timeout. Each call writes exactly once.
    pub async fn send_token(&self, token: &Token) -> Result<Value, LinkError> {
        let bytes = token.to_bytes()?;
        let (pending, outbound) = {
            let guard = self.shared.lock();
            let Connection::Connected(active) = &*guard else {
                debug!(
                    event = "send_while_disconnected",
                    transaction_id = %token.transaction_id(),
                    command = token.command()
                );
                return Err(LinkError::NotConnected);
            };
            (self.correlator.register(token)?, active.outbound.clone())
        };
        debug!(
            event = "token_sent",
            transaction_id = %token.transaction_id(),
            command = token.command(),
            len = bytes.len()
        );
        self.correlator.complete(pending, outbound, bytes).await
    }
}

/// Puts the client back to `Disconnected` if a connect attempt fails or its
/// future is dropped before the socket is up.
struct ConnectAttempt<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl ConnectAttempt<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = self.shared.lock();
        if matches!(&*guard, Connection::Connecting) {
            self.shared.replace(&mut guard, Connection::Disconnected);
        }
    }
}

async fn link_connection_worker(
    id: u64,
    mut stream: TcpStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    shared: Weak<Shared>,
    router: Arc<MessageRouter>,
    options: LinkClientOptions,
) -> CloseReport {
    let mut session = WorkerSession {
        router,
        shared: shared.clone(),
        splitter: FrameSplitter::new(options.max_frame_len),
        reported_drops: 0,
        buf: vec![0u8; options.read_buffer_len.max(1)],
    };
    let report = session
        .run(&mut stream, &mut outbound_rx, &mut shutdown_rx)
        .await;
    drop(outbound_rx);

    if let Some(shared) = shared.upgrade() {
        shared.connection_ended(id, report);
    } else {
        session.router.fail_pending();
    }
    report
}

struct WorkerSession {
    router: Arc<MessageRouter>,
    shared: Weak<Shared>,
    splitter: FrameSplitter,
    reported_drops: u64,
    buf: Vec<u8>,
}

impl WorkerSession {
    async fn run(
        &mut self,
        stream: &mut TcpStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> CloseReport {
        let (mut reader, mut writer) = stream.split();

        loop {
            tokio::select! {
                _ = &mut *shutdown_rx => {
                    return self.close_gracefully(&mut reader, &mut writer).await;
                }
                maybe_outbound = outbound_rx.recv() => {
                    match maybe_outbound {
                        Some(bytes) => {
                            if let Err(err) = writer.write_all(&bytes).await {
                                warn!(event = "link_write_failed", error = %err);
                                return CloseReport::failed();
                            }
                        }
                        None => return self.close_gracefully(&mut reader, &mut writer).await,
                    }
                }
                read = reader.read(&mut self.buf) => {
                    match read {
                        Ok(0) => {
                            info!(event = "link_closed_by_peer");
                            return CloseReport::default();
                        }
                        Ok(n) => self.dispatch(n),
                        Err(err) => {
                            warn!(event = "link_read_failed", error = %err);
                            return CloseReport::failed();
                        }
                    }
                }
            }
        }
    }

    /// Half-closes the socket and keeps dispatching until the peer closes.
    async fn close_gracefully(
        &mut self,
        reader: &mut ReadHalf<'_>,
        writer: &mut WriteHalf<'_>,
    ) -> CloseReport {
        if let Err(err) = writer.shutdown().await {
            warn!(event = "link_shutdown_failed", error = %err);
            return CloseReport::failed();
        }
        loop {
            match reader.read(&mut self.buf).await {
                Ok(0) => return CloseReport::default(),
                Ok(n) => self.dispatch(n),
                Err(err) => {
                    warn!(event = "link_read_failed", error = %err);
                    return CloseReport::failed();
                }
            }
        }
    }

    fn dispatch(&mut self, n: usize) {
        let messages = self.splitter.push(&self.buf[..n]);

        let dropped = self.splitter.dropped_frames();
        if dropped > self.reported_drops {
            if let Some(shared) = self.shared.upgrade() {
                shared
                    .dropped_frames
                    .fetch_add(dropped - self.reported_drops, Ordering::Relaxed);
            }
            self.reported_drops = dropped;
        }

        for message in messages {
            self.router.dispatch(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{ConnectOptions, LinkClient, LinkClientOptions, LinkDefaults, LinkError, LinkState};
    use crate::link::token::Token;

    #[test]
    fn default_options_use_five_second_request_timeout() {
        let options = LinkClientOptions::default();
        assert_eq!(options.request_timeout, Duration::from_millis(5000));
        assert_eq!(options.max_frame_len, LinkDefaults::MAX_FRAME_LEN);
    }

    #[test]
    fn builder_overrides_take_effect() {
        let options = LinkClientOptions::default()
            .with_request_timeout(Duration::from_millis(50))
            .with_close_timeout(Duration::from_millis(10))
            .with_read_buffer_len(0);
        assert_eq!(options.request_timeout, Duration::from_millis(50));
        assert_eq!(options.close_timeout, Duration::from_millis(10));
        assert_eq!(options.read_buffer_len, 1);
    }

    #[test]
    fn connect_target_formats_address() {
        assert_eq!(ConnectOptions::new("rov.local", 8080).addr(), "rov.local:8080");
    }

    #[test]
    fn send_while_disconnected_fails_immediately() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let client = LinkClient::default();
            assert_eq!(client.state(), LinkState::Disconnected);

            let token = Token::new("ECHO", json!(null));
            let err = client.send_token(&token).await.expect_err("not connected");
            assert!(matches!(err, LinkError::NotConnected));
            assert_eq!(client.pending_requests(), 0);
        });
    }

    #[test]
    fn disconnect_when_idle_is_a_no_op() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let client = LinkClient::default();
            let report = client.disconnect().await;
            assert!(report.is_clean());
            assert_eq!(client.state(), LinkState::Disconnected);
        });
    }
}

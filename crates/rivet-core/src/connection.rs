//! One TCP channel and its per-connection state.
//!
//! A connection owns two tasks: a reader that feeds the streaming decoder
//! and routes inbound frames, and a writer that drains a bounded queue of
//! encoded frames. Everything else (pending invokes, attributes, pool
//! keys, heartbeat counters) hangs off the shared inner.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::codec::{self, Decoded};
use crate::command::{Command, CommandKind, RequestCommand, ResponseCommand};
use crate::config::Config;
use crate::dispatch;
use crate::error::{RemotingError, StatusCode};
use crate::events::{ConnectionEventType, EventBus};
use crate::invoke::{InvokeCallback, InvokeContext, InvokeFuture, InvokeRegistry, PendingEntry};
use crate::processor::UserProcessorRegistry;
use crate::protocol::{ProtocolId, ProtocolManager};
use crate::url::Url;

/// Which side of the wire this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Environment shared by every connection of one facade instance.
pub(crate) struct RemotingContext {
    pub(crate) config: Config,
    pub(crate) role: Role,
    pub(crate) processors: Arc<UserProcessorRegistry>,
    pub(crate) events: EventBus,
}

/// Handle to one live (or closed) connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    url: Url,
    peer: SocketAddr,
    ctx: Arc<RemotingContext>,
    protocol: Mutex<ProtocolId>,
    writer_tx: mpsc::Sender<Bytes>,
    closed_tx: watch::Sender<bool>,
    closed: AtomicBool,
    invokes: InvokeRegistry,
    next_id: AtomicU32,
    attrs: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    pool_keys: Mutex<HashSet<String>>,
    heartbeat_missed: AtomicU32,
    heartbeat_enabled: AtomicBool,
    discarded_responses: AtomicU64,
    epoch: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl Connection {
    /// Establish an outbound connection and start its tasks.
    pub(crate) async fn connect(
        url: &Url,
        ctx: Arc<RemotingContext>,
    ) -> Result<Connection, RemotingError> {
        let addr = format!("{}:{}", url.host, url.port);
        let attempt = match tokio::time::timeout(url.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(source),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        };
        match attempt {
            Ok(stream) => Self::spawn(stream, url.clone(), ctx),
            Err(source) => {
                ctx.events
                    .emit(ConnectionEventType::ConnectFailed, addr.clone(), None);
                Err(RemotingError::Connect { addr, source })
            }
        }
    }

    /// Wrap an established stream (outbound or accepted) and start the
    /// reader/writer tasks. The connection is bound to its channel before
    /// any inbound byte is processed, so inbound handlers always find it.
    pub(crate) fn spawn(
        stream: TcpStream,
        url: Url,
        ctx: Arc<RemotingContext>,
    ) -> Result<Connection, RemotingError> {
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::channel(ctx.config.writer_queue_len());
        let (closed_tx, _) = watch::channel(false);

        let protocol = ProtocolId::for_code(url.protocol, ctx.config.crc_enabled);
        let read_capacity = ctx.config.read_buffer_capacity();
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                url,
                peer,
                ctx: ctx.clone(),
                protocol: Mutex::new(protocol),
                writer_tx,
                closed_tx,
                closed: AtomicBool::new(false),
                invokes: InvokeRegistry::new(),
                next_id: AtomicU32::new(1),
                attrs: Mutex::new(HashMap::new()),
                pool_keys: Mutex::new(HashSet::new()),
                heartbeat_missed: AtomicU32::new(0),
                heartbeat_enabled: AtomicBool::new(true),
                discarded_responses: AtomicU64::new(0),
                epoch: Instant::now(),
                last_read_ms: AtomicU64::new(0),
                last_write_ms: AtomicU64::new(0),
            }),
        };

        tokio::spawn(reader_task(conn.clone(), read_half, read_capacity));
        tokio::spawn(writer_task(conn.clone(), write_half, writer_rx));
        crate::heartbeat::spawn_idle_monitor(conn.clone());

        ctx.events.emit(
            ConnectionEventType::Connect,
            peer.to_string(),
            Some(conn.clone()),
        );
        Ok(conn)
    }

    // ------------------------------------------------------------------
    // Send paths
    // ------------------------------------------------------------------

    /// Send a request. Returns a future iff the request expects a response.
    ///
    /// The id is assigned here; the pending entry and its timeout task are
    /// registered before the frame is queued so a fast response can never
    /// miss them.
    pub fn invoke(
        &self,
        mut cmd: RequestCommand,
        timeout: Duration,
        callback: Option<Arc<dyn InvokeCallback>>,
        context: InvokeContext,
    ) -> Result<Option<InvokeFuture>, RemotingError> {
        if !self.is_active() {
            return Err(RemotingError::ConnectionClosed);
        }
        cmd.id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        cmd.ver2 = self.inner.url.version;
        cmd.timeout_ms = match cmd.kind {
            CommandKind::Oneway => 0,
            _ => timeout.as_millis().min(i32::MAX as u128) as i32,
        };

        let mut buf = BytesMut::new();
        codec::encode(&Command::Request(cmd.clone()), self.protocol_id(), &mut buf)?;
        let frame = buf.freeze();

        if !cmd.kind.expects_response() {
            self.enqueue(frame)?;
            return Ok(None);
        }

        let (entry, rx) = PendingEntry::new(cmd.id, timeout, callback);
        self.inner.invokes.add(entry.clone());

        if let Err(e) = self.enqueue(frame) {
            // Never leave a pending entry behind for a frame that was
            // refused before it hit the wire.
            self.inner.invokes.remove(cmd.id);
            return Err(e);
        }

        let timer_conn = self.clone();
        let id = cmd.id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = timer_conn.inner.invokes.remove(id) {
                tracing::debug!(id, peer = %timer_conn.inner.peer, "invoke timed out");
                entry.complete(ResponseCommand::local(id, StatusCode::Timeout));
            }
        });
        entry.arm_timeout(handle.abort_handle());

        Ok(Some(InvokeFuture::new(cmd.id, rx, context)))
    }

    /// Fire-and-forget send.
    pub fn oneway(&self, mut cmd: RequestCommand) -> Result<(), RemotingError> {
        cmd.kind = CommandKind::Oneway;
        self.invoke(cmd, Duration::ZERO, None, InvokeContext::new())
            .map(|_| ())
    }

    /// Queue a response frame (server side of a request).
    pub(crate) fn post_response(&self, response: ResponseCommand) -> Result<(), RemotingError> {
        let mut buf = BytesMut::new();
        codec::encode(
            &Command::Response(response),
            self.protocol_id(),
            &mut buf,
        )?;
        self.enqueue(buf.freeze())
    }

    fn enqueue(&self, frame: Bytes) -> Result<(), RemotingError> {
        match self.inner.writer_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RemotingError::Overloaded),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RemotingError::ConnectionClosed),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close the channel, complete every pending invoke with
    /// `CONNECTION_CLOSED`, and emit the Close event. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.closed_tx.send_replace(true);
        for entry in self.inner.invokes.drain() {
            entry.complete(ResponseCommand::local(entry.id, StatusCode::ConnectionClosed));
        }
        tracing::debug!(peer = %self.inner.peer, "connection closed");
        self.inner.ctx.events.emit(
            ConnectionEventType::Close,
            self.inner.peer.to_string(),
            Some(self.clone()),
        );
    }

    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn protocol_id(&self) -> ProtocolId {
        *self.inner.protocol.lock()
    }

    /// Pin the protocol used for outbound frames on this connection.
    pub fn set_protocol(&self, protocol: ProtocolId) {
        *self.inner.protocol.lock() = protocol;
    }

    /// Adopt the protocol observed on an inbound frame so answers are
    /// framed the way the peer speaks.
    pub(crate) fn observe_protocol(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let code = buf[0];
        let Some(descriptor) = ProtocolManager::global().get(code) else {
            return;
        };
        let switches = if descriptor.has_switch && buf.len() >= 2 {
            crate::protocol::ProtocolSwitch::from_bits_truncate(buf[1])
        } else {
            crate::protocol::ProtocolSwitch::empty()
        };
        let mut slot = self.inner.protocol.lock();
        let observed = ProtocolId { code, switches };
        if *slot != observed {
            *slot = observed;
        }
    }

    pub fn attr_set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.attrs.lock().insert(key.into(), Arc::new(value));
    }

    pub fn attr_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner
            .attrs
            .lock()
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub(crate) fn add_pool_key(&self, key: &str) {
        self.inner.pool_keys.lock().insert(key.to_string());
    }

    pub(crate) fn remove_pool_key(&self, key: &str) {
        self.inner.pool_keys.lock().remove(key);
    }

    /// Every pool alias this connection is reachable through.
    pub fn pool_keys(&self) -> Vec<String> {
        self.inner.pool_keys.lock().iter().cloned().collect()
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.inner.heartbeat_enabled.load(Ordering::Relaxed)
    }

    pub fn set_heartbeat_enabled(&self, enabled: bool) {
        self.inner.heartbeat_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn heartbeat_missed(&self) -> u32 {
        self.inner.heartbeat_missed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_heartbeat_miss(&self) -> u32 {
        self.inner.heartbeat_missed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_heartbeat_missed(&self) {
        self.inner.heartbeat_missed.store(0, Ordering::Relaxed);
    }

    /// Responses that arrived with no matching pending entry.
    pub fn discarded_responses(&self) -> u64 {
        self.inner.discarded_responses.load(Ordering::Relaxed)
    }

    pub(crate) fn count_discarded_response(&self) {
        self.inner.discarded_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_read(&self) {
        self.inner
            .last_read_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn mark_write(&self) {
        self.inner
            .last_write_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last activity in either direction.
    pub(crate) fn idle_for(&self) -> Duration {
        let now = self.inner.epoch.elapsed().as_millis() as u64;
        let last = self
            .inner
            .last_read_ms
            .load(Ordering::Relaxed)
            .max(self.inner.last_write_ms.load(Ordering::Relaxed));
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Time since the last inbound byte.
    pub(crate) fn read_idle_for(&self) -> Duration {
        let now = self.inner.epoch.elapsed().as_millis() as u64;
        let last = self.inner.last_read_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub(crate) fn context(&self) -> &Arc<RemotingContext> {
        &self.inner.ctx
    }

    pub(crate) fn invokes(&self) -> &InvokeRegistry {
        &self.inner.invokes
    }

    /// Number of requests currently awaiting responses.
    pub fn pending_invokes(&self) -> usize {
        self.inner.invokes.len()
    }

    /// Reap pending invokes past their deadline. Safety net behind the
    /// per-request timers; returns the number reaped.
    pub(crate) fn scan_invokes(&self, now: Instant) -> usize {
        let expired = self.inner.invokes.scan_expired(now);
        let count = expired.len();
        for entry in expired {
            tracing::warn!(id = entry.id, peer = %self.inner.peer, "reaping leaked pending invoke");
            entry.complete(ResponseCommand::local(entry.id, StatusCode::Timeout));
        }
        count
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Identity comparison; pools unlink by handle, not by address.
    pub(crate) fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("active", &self.is_active())
            .field("pending", &self.inner.invokes.len())
            .finish()
    }
}

async fn reader_task(conn: Connection, mut read_half: OwnedReadHalf, capacity: usize) {
    let mut closed_rx = conn.closed_watch();
    let mut buf = BytesMut::with_capacity(capacity);
    loop {
        if *closed_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = closed_rx.changed() => break,
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(peer = %conn.remote_addr(), "peer closed the stream");
                    conn.close();
                    break;
                }
                Ok(_) => {
                    conn.mark_read();
                    if !drain_frames(&conn, &mut buf).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %conn.remote_addr(), error = %e, "read failed");
                    conn.context().events.emit(
                        ConnectionEventType::Exception,
                        conn.remote_addr().to_string(),
                        Some(conn.clone()),
                    );
                    conn.close();
                    break;
                }
            }
        }
    }
}

/// Decode and route every complete frame in `buf`. Returns false when the
/// stream is torn and the connection was closed.
async fn drain_frames(conn: &Connection, buf: &mut BytesMut) -> bool {
    loop {
        conn.observe_protocol(buf);
        match codec::decode(buf) {
            Ok(Decoded::Incomplete) => return true,
            Ok(Decoded::Frame(cmd)) => dispatch::handle_inbound(conn, cmd).await,
            Ok(Decoded::Corrupt { id, kind, error }) => {
                dispatch::handle_corrupt(conn, id, kind, &error);
            }
            Err(e) => {
                tracing::error!(peer = %conn.remote_addr(), error = %e, "framing lost, closing");
                conn.context().events.emit(
                    ConnectionEventType::Exception,
                    conn.remote_addr().to_string(),
                    Some(conn.clone()),
                );
                conn.close();
                return false;
            }
        }
    }
}

async fn writer_task(
    conn: Connection,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let mut closed_rx = conn.closed_watch();
    loop {
        if *closed_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = closed_rx.changed() => break,
            item = rx.recv() => match item {
                Some(frame) => {
                    if let Err(e) = write_half.write_all(&frame).await {
                        tracing::warn!(peer = %conn.remote_addr(), error = %e, "write failed");
                        conn.close();
                        break;
                    }
                    if let Err(e) = write_half.flush().await {
                        tracing::warn!(peer = %conn.remote_addr(), error = %e, "flush failed");
                        conn.close();
                        break;
                    }
                    conn.mark_write();
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::CODEC_RAW;

    async fn connected_pair(role: Role) -> (Connection, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = accept.await.unwrap();

        let (events, _events_rx) = EventBus::channel();
        let ctx = Arc::new(RemotingContext {
            config: Config::from_env(),
            role,
            processors: Arc::new(UserProcessorRegistry::new()),
            events,
        });
        let url = Url::parse(&addr.to_string(), &ctx.config).unwrap();
        let conn = Connection::spawn(stream, url, ctx).unwrap();
        (conn, peer)
    }

    fn raw_request() -> RequestCommand {
        RequestCommand::new(
            CommandKind::Request,
            CODEC_RAW,
            0,
            "X".to_string(),
            Bytes::new(),
            Bytes::from_static(b"payload"),
        )
    }

    #[tokio::test]
    async fn close_fails_pendings_with_connection_closed() {
        let (conn, _peer) = connected_pair(Role::Client).await;

        let future = conn
            .invoke(raw_request(), Duration::from_secs(30), None, InvokeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(conn.pending_invokes(), 1);

        conn.close();
        let response = future.wait().await.unwrap();
        assert_eq!(response.status, StatusCode::ConnectionClosed);
        assert!(!conn.is_active());
        assert_eq!(conn.pending_invokes(), 0);
    }

    #[tokio::test]
    async fn oneway_registers_no_pending() {
        let (conn, _peer) = connected_pair(Role::Client).await;
        conn.oneway(raw_request()).unwrap();
        assert_eq!(conn.pending_invokes(), 0);
        conn.close();
    }

    #[tokio::test]
    async fn invoke_ids_are_unique_per_connection() {
        let (conn, _peer) = connected_pair(Role::Client).await;
        let a = conn
            .invoke(raw_request(), Duration::from_secs(5), None, InvokeContext::new())
            .unwrap()
            .unwrap();
        let b = conn
            .invoke(raw_request(), Duration::from_secs(5), None, InvokeContext::new())
            .unwrap()
            .unwrap();
        assert_ne!(a.id(), b.id());
        conn.close();
    }

    #[tokio::test]
    async fn attributes_round_trip() {
        let (conn, _peer) = connected_pair(Role::Client).await;
        conn.attr_set("weight", 7u32);
        assert_eq!(*conn.attr_get::<u32>("weight").unwrap(), 7);
        assert!(conn.attr_get::<String>("weight").is_none());
        conn.close();
    }
}

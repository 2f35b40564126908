//! Logical network connections.
//!
//! A [`Connection`] wraps one stream transport and exposes the contract the
//! core keeps with protocol owners: queue byte buffers to send, deliver byte
//! buffers received, and report lifecycle events through a
//! [`ConnectionListener`]. The connection performs no I/O on its own. A
//! read entity and a write entity (one each per direction) are registered
//! with the rate-limited schedulers, which drive bounded non-blocking
//! operations through [`Connection::process_read`] /
//! [`Connection::process_write`].
//!
//! Outgoing payloads pass through a [`StreamEncoder`], incoming bytes through
//! a [`StreamDecoder`]; the core never interprets either beyond invoking
//! them. The raw pass-through implementations are the common case.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::NetError;
use crate::scheduler::RateControlled;

/// How long an outbound transport establishment may take before the
/// connection is failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single scheduled read, independent of rate allowance.
const READ_QUANTUM: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier for a connection, used as the registry key by the
/// transfer processors and schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mint a fresh id without a backing connection.
#[cfg(test)]
pub(crate) fn fresh_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Frames an outgoing payload into wire bytes.
pub trait StreamEncoder: Send + Sync {
    /// Encode one payload buffer.
    fn encode(&self, payload: &[u8]) -> Vec<u8>;
}

/// Extracts complete messages from buffered incoming bytes.
pub trait StreamDecoder: Send + Sync {
    /// Consume as much of `buffered` as possible, returning any complete
    /// messages. Bytes left in `buffered` are retained for the next call.
    fn decode(&self, buffered: &mut Vec<u8>) -> Vec<Vec<u8>>;
}

/// Produces encoder/decoder pairs for routed inbound connections.
pub trait StreamFactory: Send + Sync {
    /// Create the encoder for a new connection.
    fn create_encoder(&self) -> Box<dyn StreamEncoder>;
    /// Create the decoder for a new connection.
    fn create_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// Pass-through encoder: payloads go to the wire unchanged.
pub struct RawStreamEncoder;

impl StreamEncoder for RawStreamEncoder {
    fn encode(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

/// Pass-through decoder: every read is delivered as one message.
pub struct RawStreamDecoder;

impl StreamDecoder for RawStreamDecoder {
    fn decode(&self, buffered: &mut Vec<u8>) -> Vec<Vec<u8>> {
        if buffered.is_empty() {
            Vec::new()
        } else {
            vec![std::mem::take(buffered)]
        }
    }
}

/// Factory producing the raw pass-through codec.
pub struct RawStreamFactory;

impl StreamFactory for RawStreamFactory {
    fn create_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(RawStreamEncoder)
    }

    fn create_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(RawStreamDecoder)
    }
}

/// Lifecycle and data callbacks for a connection's owner.
pub trait ConnectionListener: Send + Sync {
    /// Outbound transport establishment has begun.
    fn connect_started(&self) {}

    /// Outbound transport establishment succeeded.
    fn connect_success(&self) {}

    /// Outbound transport establishment failed.
    fn connect_failure(&self, _error: &NetError) {}

    /// A decoded message arrived.
    fn message_received(&self, message: Vec<u8>);

    /// The transport failed; the connection will move no more data. The
    /// owner is expected to stop transfer processing and close.
    fn connection_error(&self, _error: &NetError) {}
}

struct NullListener;

impl ConnectionListener for NullListener {
    fn message_received(&self, _message: Vec<u8>) {}
}

/// Crypto-policy parameters carried for the outer transport wrapper. The
/// core itself performs no encryption.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Attempt the encrypted handshake when establishing.
    pub connect_with_crypto: bool,
    /// Permit plaintext fallback if the encrypted handshake fails.
    pub allow_fallback: bool,
    /// Shared secrets for the handshake.
    pub shared_secrets: Vec<Vec<u8>>,
}

struct ReadState {
    /// Undecoded bytes: the unconsumed matcher prefix for inbound
    /// connections, plus anything the decoder has not yet consumed.
    pending: Vec<u8>,
    decoder: Box<dyn StreamDecoder>,
}

struct WriteState {
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the queue head already written.
    head_offset: usize,
    encoder: Box<dyn StreamEncoder>,
}

/// One logical peer connection.
pub struct Connection {
    id: ConnectionId,
    target: SocketAddr,
    lan_local: AtomicBool,
    /// Scheduler placement hint; `-1` means default/no partition.
    partition_id: AtomicI32,
    params: ConnectParams,
    transport: Mutex<Option<TcpStream>>,
    read_state: Mutex<ReadState>,
    write_state: Mutex<WriteState>,
    listener: RwLock<Arc<dyn ConnectionListener>>,
    failed: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    fn new(
        target: SocketAddr,
        transport: Option<TcpStream>,
        prefix: Vec<u8>,
        encoder: Box<dyn StreamEncoder>,
        decoder: Box<dyn StreamDecoder>,
        params: ConnectParams,
        listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            target,
            lan_local: AtomicBool::new(false),
            partition_id: AtomicI32::new(-1),
            params,
            transport: Mutex::new(transport),
            read_state: Mutex::new(ReadState {
                pending: prefix,
                decoder,
            }),
            write_state: Mutex::new(WriteState {
                queue: VecDeque::new(),
                head_offset: 0,
                encoder,
            }),
            listener: RwLock::new(listener),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Create an unconnected outbound connection. Call
    /// [`Connection::connect`] to begin transport establishment.
    pub fn new_outbound(
        target: SocketAddr,
        encoder: Box<dyn StreamEncoder>,
        decoder: Box<dyn StreamDecoder>,
        params: ConnectParams,
        listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        Self::new(target, None, Vec::new(), encoder, decoder, params, listener)
    }

    /// Wrap an already-established inbound (or externally produced) stream.
    /// `prefix` carries bytes already read from the socket, unconsumed; they
    /// are delivered ahead of further socket data. The owner installs its
    /// listener with [`Connection::set_listener`].
    pub fn new_inbound(
        stream: TcpStream,
        peer: SocketAddr,
        prefix: Vec<u8>,
        encoder: Box<dyn StreamEncoder>,
        decoder: Box<dyn StreamDecoder>,
    ) -> Arc<Self> {
        Self::new(
            peer,
            Some(stream),
            prefix,
            encoder,
            decoder,
            ConnectParams::default(),
            Arc::new(NullListener),
        )
    }

    /// Begin asynchronous transport establishment. Never blocks; the outcome
    /// is reported through the listener.
    pub fn connect(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.current_listener().connect_started();
            let result =
                tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(conn.target)).await;
            let stream = match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let err = NetError::Connect(e.to_string());
                    tracing::debug!(id = %conn.id, target = %conn.target, error = %e, "connect failed");
                    conn.failed.store(true, Ordering::Relaxed);
                    conn.current_listener().connect_failure(&err);
                    return;
                }
                Err(_) => {
                    let err = NetError::Timeout(format!("connect to {}", conn.target));
                    tracing::debug!(id = %conn.id, target = %conn.target, "connect timed out");
                    conn.failed.store(true, Ordering::Relaxed);
                    conn.current_listener().connect_failure(&err);
                    return;
                }
            };
            if conn.closed.load(Ordering::Relaxed) {
                return; // closed while connecting; drop the socket
            }
            *conn.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
            tracing::debug!(id = %conn.id, target = %conn.target, "connected");
            conn.current_listener().connect_success();
        });
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Crypto-policy parameters supplied at creation.
    pub fn connect_params(&self) -> &ConnectParams {
        &self.params
    }

    /// Whether the peer was judged to be on the local network.
    pub fn is_lan_local(&self) -> bool {
        self.lan_local.load(Ordering::Relaxed)
    }

    /// Mark the peer as LAN-local. Only meaningful before transfer
    /// processing starts; the LAN/WAN decision is made at registration.
    pub fn set_lan_local(&self, lan_local: bool) {
        self.lan_local.store(lan_local, Ordering::Relaxed);
    }

    /// Scheduler placement hint, `-1` for default.
    pub fn partition_id(&self) -> i32 {
        self.partition_id.load(Ordering::Relaxed)
    }

    /// Set the scheduler placement hint.
    pub fn set_partition_id(&self, partition_id: i32) {
        self.partition_id.store(partition_id, Ordering::Relaxed);
    }

    /// Replace the lifecycle listener. Routed inbound connections start with
    /// a no-op listener; owners install theirs before starting transfer
    /// processing.
    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = listener;
    }

    fn current_listener(&self) -> Arc<dyn ConnectionListener> {
        Arc::clone(&self.listener.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Queue a payload for sending. The payload is framed by the encoder and
    /// drained by the write scheduler under rate control.
    pub fn send(&self, payload: &[u8]) -> crate::error::Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.failed.load(Ordering::Relaxed) {
            return Err(NetError::Closed);
        }
        let mut state = self
            .write_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let framed = state.encoder.encode(payload);
        if !framed.is_empty() {
            state.queue.push_back(framed);
        }
        Ok(())
    }

    /// Whether any queued outbound bytes remain undrained.
    pub fn has_queued_writes(&self) -> bool {
        !self
            .write_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .is_empty()
    }

    /// Whether the connection has been closed or has failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Close the transport and discard queued writes. The caller must have
    /// already deregistered the connection from transfer processing so no
    /// scheduler touches a closing handle.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut state = self
            .write_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.queue.clear();
        state.head_offset = 0;
        tracing::debug!(id = %self.id, target = %self.target, "connection closed");
    }

    /// Latch the failure state and notify the owner exactly once.
    fn fail(&self, error: NetError) {
        if self.failed.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::debug!(id = %self.id, target = %self.target, error = %error, "transport error");
        self.current_listener().connection_error(&error);
    }

    /// One bounded non-blocking read, limited by `allowance`. Returns bytes
    /// moved off the socket; decoded messages are delivered inline.
    pub(crate) fn process_read(&self, allowance: usize) -> usize {
        if self.closed.load(Ordering::Relaxed) || self.failed.load(Ordering::Relaxed) {
            return 0;
        }
        let mut chunk = vec![0u8; allowance.min(READ_QUANTUM)];
        let read = {
            let guard = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(stream) = guard.as_ref() else {
                // Not yet connected (or already closed): only drain any
                // buffered prefix below.
                drop(guard);
                self.deliver_decoded();
                return 0;
            };
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    drop(guard);
                    self.fail(NetError::EndOfStream);
                    return 0;
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(e) => {
                    drop(guard);
                    self.fail(NetError::Io(e));
                    return 0;
                }
            }
        };
        if read > 0 {
            let mut state = self
                .read_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.pending.extend_from_slice(&chunk[..read]);
        }
        self.deliver_decoded();
        read
    }

    /// Run the decoder over pending bytes and deliver complete messages.
    fn deliver_decoded(&self) {
        let messages = {
            let mut state = self
                .read_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.pending.is_empty() {
                return;
            }
            let mut pending = std::mem::take(&mut state.pending);
            let messages = state.decoder.decode(&mut pending);
            state.pending = pending;
            messages
        };
        if !messages.is_empty() {
            let listener = self.current_listener();
            for message in messages {
                listener.message_received(message);
            }
        }
    }

    /// One bounded non-blocking write from the queue head, limited by
    /// `allowance`. Returns bytes accepted by the socket; a full OS send
    /// buffer simply yields zero and the write is retried next cycle.
    pub(crate) fn process_write(&self, allowance: usize) -> usize {
        if self.closed.load(Ordering::Relaxed) || self.failed.load(Ordering::Relaxed) {
            return 0;
        }
        let mut state = self
            .write_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(front) = state.queue.front() else {
            return 0;
        };
        let start = state.head_offset;
        let end = (start + allowance).min(front.len());
        let written = {
            let guard = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(stream) = guard.as_ref() else {
                return 0;
            };
            match stream.try_write(&front[start..end]) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return 0,
                Err(e) => {
                    drop(guard);
                    drop(state);
                    self.fail(NetError::Io(e));
                    return 0;
                }
            }
        };
        state.head_offset += written;
        if state.head_offset
            >= state
                .queue
                .front()
                .map(Vec::len)
                .unwrap_or(state.head_offset)
        {
            state.queue.pop_front();
            state.head_offset = 0;
        }
        written
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("lan_local", &self.is_lan_local())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Download-direction entity registered with a read scheduler.
pub(crate) struct ReadEntity {
    conn: Arc<Connection>,
}

impl ReadEntity {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self { conn })
    }
}

impl RateControlled for ReadEntity {
    fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    fn process(&self, allowance: usize) -> usize {
        self.conn.process_read(allowance)
    }
}

/// Upload-direction entity registered with a write scheduler.
pub(crate) struct WriteEntity {
    conn: Arc<Connection>,
}

impl WriteEntity {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self { conn })
    }
}

impl RateControlled for WriteEntity {
    fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    fn process(&self, allowance: usize) -> usize {
        self.conn.process_write(allowance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingListener {
        messages: StdMutex<Vec<Vec<u8>>>,
        connected: AtomicBool,
        connect_failed: AtomicBool,
        errors: AtomicBool,
    }

    impl ConnectionListener for RecordingListener {
        fn connect_success(&self) {
            self.connected.store(true, Ordering::Relaxed);
        }

        fn connect_failure(&self, _error: &NetError) {
            self.connect_failed.store(true, Ordering::Relaxed);
        }

        fn message_received(&self, message: Vec<u8>) {
            self.messages.lock().unwrap().push(message);
        }

        fn connection_error(&self, _error: &NetError) {
            self.errors.store(true, Ordering::Relaxed);
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn inbound(stream: TcpStream, prefix: &[u8]) -> (Arc<Connection>, Arc<RecordingListener>) {
        let peer = stream.peer_addr().unwrap();
        let conn = Connection::new_inbound(
            stream,
            peer,
            prefix.to_vec(),
            Box::new(RawStreamEncoder),
            Box::new(RawStreamDecoder),
        );
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(Arc::clone(&listener) as Arc<dyn ConnectionListener>);
        (conn, listener)
    }

    #[test]
    fn raw_codec_is_passthrough() {
        let enc = RawStreamEncoder;
        assert_eq!(enc.encode(b"abc"), b"abc".to_vec());
        let dec = RawStreamDecoder;
        let mut buf = b"hello".to_vec();
        assert_eq!(dec.decode(&mut buf), vec![b"hello".to_vec()]);
        assert!(buf.is_empty());
        assert!(dec.decode(&mut buf).is_empty());
    }

    #[tokio::test]
    async fn prefix_bytes_are_delivered_first() {
        let (mut client, server) = socket_pair().await;
        let (conn, listener) = inbound(server, b"prefix");

        conn.process_read(1024);
        assert_eq!(listener.messages.lock().unwrap()[0], b"prefix".to_vec());

        client.write_all(b"more").await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.process_read(1024);
        assert_eq!(listener.messages.lock().unwrap()[1], b"more".to_vec());
    }

    #[tokio::test]
    async fn queued_sends_drain_under_allowance() {
        let (mut client, server) = socket_pair().await;
        let (conn, _listener) = inbound(server, b"");

        conn.send(b"0123456789").unwrap();
        assert!(conn.has_queued_writes());

        // The driver reports write readiness only after a yield, so the
        // first attempts may see WouldBlock; spin until the socket opens up.
        let first = timeout(Duration::from_secs(2), async {
            loop {
                let n = conn.process_write(4);
                if n > 0 {
                    break n;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("socket never became writable");

        // Bounded writes: 4 + 4 + 2.
        assert_eq!(first, 4);
        assert_eq!(conn.process_write(4), 4);
        assert_eq!(conn.process_write(4), 2);
        assert!(!conn.has_queued_writes());
        assert_eq!(conn.process_write(4), 0);

        let mut buf = [0u8; 10];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[tokio::test]
    async fn peer_close_reports_error_once() {
        let (client, server) = socket_pair().await;
        let (conn, listener) = inbound(server, b"");

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.process_read(1024);
        assert!(listener.errors.load(Ordering::Relaxed));
        // Further processing is a no-op.
        assert_eq!(conn.process_read(1024), 0);
        assert_eq!(conn.process_write(1024), 0);
        assert!(conn.send(b"x").is_err());
    }

    #[tokio::test]
    async fn close_discards_queue_and_rejects_sends() {
        let (_client, server) = socket_pair().await;
        let (conn, _listener) = inbound(server, b"");
        conn.send(b"data").unwrap();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.has_queued_writes());
        assert!(matches!(conn.send(b"more"), Err(NetError::Closed)));
        assert_eq!(conn.process_write(1024), 0);
    }

    #[tokio::test]
    async fn outbound_connect_reports_success() {
        let listener_sock = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener_sock.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener_sock.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let listener = Arc::new(RecordingListener::default());
        let conn = Connection::new_outbound(
            addr,
            Box::new(RawStreamEncoder),
            Box::new(RawStreamDecoder),
            ConnectParams::default(),
            Arc::clone(&listener) as Arc<dyn ConnectionListener>,
        );
        conn.connect();

        timeout(Duration::from_secs(2), async {
            while !listener.connected.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connect did not complete");
    }

    #[tokio::test]
    async fn outbound_connect_failure_is_reported() {
        // Bind-then-drop gives a port with nothing listening.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let listener = Arc::new(RecordingListener::default());
        let conn = Connection::new_outbound(
            addr,
            Box::new(RawStreamEncoder),
            Box::new(RawStreamDecoder),
            ConnectParams::default(),
            Arc::clone(&listener) as Arc<dyn ConnectionListener>,
        );
        conn.connect();

        timeout(Duration::from_secs(5), async {
            while !listener.connect_failed.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connect failure not reported");
    }

    #[tokio::test]
    async fn partition_hint_defaults_to_none() {
        let (_client, server) = socket_pair().await;
        let (conn, _listener) = inbound(server, b"");
        assert_eq!(conn.partition_id(), -1);
        conn.set_partition_id(3);
        assert_eq!(conn.partition_id(), 3);
    }
}

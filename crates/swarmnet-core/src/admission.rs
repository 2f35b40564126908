//! Inbound connection admission.
//!
//! The [`MatchRegistry`] holds the byte matchers registered by protocol
//! owners. The [`Acceptor`] binds the listen socket, buffers the first bytes
//! of each accepted connection, and consults the registry after every read;
//! the first matcher (in registration order) to claim the bytes receives the
//! stream through its [`MatchListener`]. Connections that no matcher claims
//! once enough bytes are buffered, and connections that go quiet before
//! producing a signature, are dropped.
//!
//! Expired pending connections are swept lazily when a new connection
//! arrives, at most once per [`SWEEP_MIN_INTERVAL`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ConfigHandle, NetworkConfig};
use crate::error::{NetError, Result};
use crate::matcher::{ByteMatcher, MatchListener, RoutingData};
use crate::stats::NetworkStats;

/// A pending connection that has produced no bytes at all is dropped after
/// this long.
const ZERO_BYTE_TIMEOUT: Duration = Duration::from_secs(60);

/// A pending connection that has produced bytes but then gone quiet is
/// dropped this long after its last byte.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between expiry sweeps.
const SWEEP_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Pending-connection read poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Listen backlog.
const ACCEPT_BACKLOG: i32 = 1024;

struct MatchRegistration {
    matcher: Arc<dyn ByteMatcher>,
    listener: Arc<dyn MatchListener>,
}

/// Ordered set of registered byte matchers.
pub(crate) struct MatchRegistry {
    /// Registration order is priority order among overlapping signatures.
    matchers: Mutex<Vec<MatchRegistration>>,
    /// Max bytes any matcher needs; buffering stops here.
    max_match_bytes: AtomicUsize,
}

impl MatchRegistry {
    pub(crate) fn new() -> Self {
        Self {
            matchers: Mutex::new(Vec::new()),
            max_match_bytes: AtomicUsize::new(0),
        }
    }

    /// Append a matcher. No-op if this exact matcher is already registered.
    pub(crate) fn register(
        &self,
        matcher: Arc<dyn ByteMatcher>,
        listener: Arc<dyn MatchListener>,
    ) {
        let mut matchers = self
            .matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matchers.iter().any(|r| Arc::ptr_eq(&r.matcher, &matcher)) {
            return;
        }
        matchers.push(MatchRegistration { matcher, listener });
        self.recompute_max(&matchers);
    }

    /// Remove a matcher. Returns whether it was registered.
    pub(crate) fn deregister(&self, matcher: &Arc<dyn ByteMatcher>) -> bool {
        let mut matchers = self
            .matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = matchers.len();
        matchers.retain(|r| !Arc::ptr_eq(&r.matcher, matcher));
        let removed = matchers.len() != before;
        if removed {
            self.recompute_max(&matchers);
        }
        removed
    }

    fn recompute_max(&self, matchers: &[MatchRegistration]) {
        let max = matchers
            .iter()
            .map(|r| r.matcher.max_size())
            .max()
            .unwrap_or(0);
        self.max_match_bytes.store(max, Ordering::Relaxed);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn max_match_bytes(&self) -> usize {
        self.max_match_bytes.load(Ordering::Relaxed)
    }

    /// Consult every matcher in registration order against the buffered
    /// bytes. Full checks run once a matcher's threshold is buffered; early
    /// partial checks run from `min_size` bytes on.
    pub(crate) fn check_for_match(
        &self,
        buffer: &[u8],
        local_port: u16,
    ) -> Option<(Arc<dyn MatchListener>, RoutingData)> {
        let matchers = self
            .matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for registration in matchers.iter() {
            if let Some(port) = registration.matcher.specific_port() {
                if port != local_port {
                    continue;
                }
            }
            let hit = if buffer.len() >= registration.matcher.match_this_size_or_bigger() {
                registration.matcher.matches(buffer, local_port)
            } else if buffer.len() >= registration.matcher.min_size() {
                registration.matcher.min_matches(buffer, local_port)
            } else {
                None
            };
            if let Some(routing_data) = hit {
                return Some((Arc::clone(&registration.listener), routing_data));
            }
        }
        None
    }
}

struct PendingConnection {
    stream: TcpStream,
    peer: SocketAddr,
    local_port: u16,
    buffer: Vec<u8>,
    accepted_at: Instant,
    last_byte_at: Instant,
}

impl PendingConnection {
    fn is_expired(&self, now: Instant) -> bool {
        if self.buffer.is_empty() {
            now.duration_since(self.accepted_at) >= ZERO_BYTE_TIMEOUT
        } else {
            now.duration_since(self.last_byte_at) >= IDLE_READ_TIMEOUT
        }
    }
}

/// Drop pending connections past their timeout.
fn sweep_expired(pending: &mut Vec<PendingConnection>, now: Instant, stats: &NetworkStats) {
    pending.retain(|p| {
        if p.is_expired(now) {
            tracing::debug!(
                peer = %p.peer,
                buffered = p.buffer.len(),
                "pending connection timed out"
            );
            stats.add_connection_dropped();
            false
        } else {
            true
        }
    });
}

/// One non-blocking read pass over all pending connections, handing off any
/// that now match and dropping any that cannot.
fn poll_pending(pending: &mut Vec<PendingConnection>, registry: &MatchRegistry, stats: &NetworkStats) {
    let cap = registry.max_match_bytes();
    let now = Instant::now();
    let mut i = 0;
    while i < pending.len() {
        let p = &mut pending[i];
        let room = cap.saturating_sub(p.buffer.len());
        if room > 0 {
            let mut chunk = vec![0u8; room];
            match p.stream.try_read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!(peer = %p.peer, "pending connection closed by peer");
                    stats.add_connection_dropped();
                    pending.remove(i);
                    continue;
                }
                Ok(n) => {
                    p.buffer.extend_from_slice(&chunk[..n]);
                    p.last_byte_at = now;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::debug!(peer = %p.peer, error = %e, "pending connection read error");
                    stats.add_connection_dropped();
                    pending.remove(i);
                    continue;
                }
            }
        }
        if !p.buffer.is_empty() {
            if let Some((listener, routing_data)) =
                registry.check_for_match(&p.buffer, p.local_port)
            {
                let p = pending.remove(i);
                tracing::debug!(peer = %p.peer, buffered = p.buffer.len(), "connection matched");
                stats.add_connection_routed();
                listener.connection_matched(p.stream, p.buffer, routing_data);
                continue;
            }
            if cap > 0 && p.buffer.len() >= cap {
                tracing::debug!(
                    peer = %p.peer,
                    buffered = p.buffer.len(),
                    "no routing match, giving up"
                );
                stats.add_connection_dropped();
                pending.remove(i);
                continue;
            }
        }
        i += 1;
    }
}

/// Bind the listen socket per the configuration.
fn bind_listener(cfg: &NetworkConfig) -> Result<TcpListener> {
    let ip = cfg
        .bind_address
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(ip, cfg.listen_port);
    let bind = || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if cfg.so_rcvbuf_size > 0 {
            socket.set_recv_buffer_size(cfg.so_rcvbuf_size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(ACCEPT_BACKLOG)?;
        Ok(socket.into())
    };
    let std_listener = bind().map_err(|e| NetError::Bind(format!("{addr}: {e}")))?;
    TcpListener::from_std(std_listener).map_err(NetError::Io)
}

/// Apply per-connection socket options from the configuration. Option
/// failures are logged, not fatal.
fn apply_socket_options(stream: &TcpStream, cfg: &NetworkConfig) {
    let sock = SockRef::from(stream);
    if cfg.so_sndbuf_size > 0 {
        if let Err(e) = sock.set_send_buffer_size(cfg.so_sndbuf_size) {
            tracing::debug!(error = %e, "failed to set send buffer size");
        }
    }
    if let Some(tos) = cfg.ip_tos {
        let is_v4 = stream
            .peer_addr()
            .map(|a| a.is_ipv4())
            .unwrap_or(false);
        if is_v4 {
            if let Err(e) = sock.set_tos_v4(tos) {
                tracing::debug!(error = %e, "failed to set IP TOS");
            }
        }
    }
}

/// Fields of the configuration the bound socket depends on.
fn bound_params(cfg: &NetworkConfig) -> (u16, Option<IpAddr>, usize) {
    (cfg.listen_port, cfg.bind_address, cfg.so_rcvbuf_size)
}

/// The inbound listen loop. Created by the manager; owns the listen socket
/// and the pending-connection set.
pub(crate) struct Acceptor {
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    task: JoinHandle<()>,
}

impl Acceptor {
    /// Bind the listen socket and spawn the accept loop. Must run inside a
    /// runtime. Rebinds automatically when the configured port, bind address
    /// or receive buffer change, keeping already-pending connections alive.
    pub(crate) fn spawn(
        registry: Arc<MatchRegistry>,
        config: ConfigHandle,
        stats: Arc<NetworkStats>,
    ) -> Result<Self> {
        // Subscribe before binding so a config update published while the
        // loop task is still being scheduled is observed as a change, and
        // bind from the receiver's own snapshot so the change comparison
        // starts from the configuration the socket was actually bound with.
        let mut cfg_rx = config.subscribe();
        let cfg = cfg_rx.borrow_and_update().clone();
        let listener = bind_listener(&cfg)?;
        let addr = listener.local_addr().map_err(NetError::Io)?;
        tracing::info!(%addr, "listening for inbound connections");

        let local_addr = Arc::new(Mutex::new(Some(addr)));
        let shared_addr = Arc::clone(&local_addr);
        let task = tokio::spawn(accept_loop(
            listener,
            bound_params(&cfg),
            cfg_rx,
            registry,
            config,
            stats,
            shared_addr,
        ));
        Ok(Self { local_addr, task })
    }

    /// Address the listen socket is currently bound to.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shutdown(&self) {
        self.task.abort();
    }
}

async fn accept_loop(
    mut listener: TcpListener,
    mut bound: (u16, Option<IpAddr>, usize),
    mut cfg_rx: tokio::sync::watch::Receiver<NetworkConfig>,
    registry: Arc<MatchRegistry>,
    config: ConfigHandle,
    stats: Arc<NetworkStats>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending: Vec<PendingConnection> = Vec::new();
    let mut last_sweep = Instant::now();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let now = Instant::now();
                        if now.duration_since(last_sweep) >= SWEEP_MIN_INTERVAL {
                            sweep_expired(&mut pending, now, &stats);
                            last_sweep = now;
                        }
                        if registry.is_empty() {
                            tracing::warn!(%peer, "no matchers registered, dropping connection");
                            stats.add_connection_dropped();
                            continue;
                        }
                        let cfg = config.current();
                        apply_socket_options(&stream, &cfg);
                        let local_port = stream
                            .local_addr()
                            .map(|a| a.port())
                            .unwrap_or(cfg.listen_port);
                        tracing::debug!(%peer, "connection accepted");
                        pending.push(PendingConnection {
                            stream,
                            peer,
                            local_port,
                            buffer: Vec::new(),
                            accepted_at: now,
                            last_byte_at: now,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = tick.tick() => {
                poll_pending(&mut pending, &registry, &stats);
            }
            changed = cfg_rx.changed() => {
                if changed.is_err() {
                    break; // configuration handle dropped; shut down
                }
                let cfg = cfg_rx.borrow_and_update().clone();
                let new_bound = bound_params(&cfg);
                if new_bound != bound {
                    match bind_listener(&cfg) {
                        Ok(new_listener) => {
                            let addr = new_listener.local_addr().ok();
                            tracing::info!(addr = ?addr, "listen socket rebound");
                            listener = new_listener;
                            bound = new_bound;
                            *local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "rebind failed, keeping old socket");
                        }
                    }
                }
            }
        }
    }
}

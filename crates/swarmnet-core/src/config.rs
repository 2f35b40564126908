//! Live network configuration.
//!
//! All values are hot-reloadable through a [`tokio::sync::watch`] channel:
//! the owning application publishes a new [`NetworkConfig`] via
//! [`ConfigHandle::update`] and every component observing the receiver picks
//! the change up on its next loop iteration. The only read-once exceptions
//! are the scheduler pool sizes, which require constructing a new
//! [`crate::NetworkManager`] to change.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::watch;

/// Configuration inputs for the network core.
///
/// Rate values are expressed in KB/s the way the user configures them;
/// `0` (or anything below 1 KB/s) means unlimited. Derivation into effective
/// byte-per-second ceilings, including clamping and download-admission
/// inflation, happens in one place inside the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Upload ceiling in KB/s while not in seeding-only mode.
    pub max_upload_kbs: u32,
    /// Upload ceiling in KB/s while seeding-only mode is active.
    pub max_upload_seeding_kbs: u32,
    /// Download ceiling in KB/s.
    pub max_download_kbs: u32,
    /// LAN upload ceiling in KB/s.
    pub max_lan_upload_kbs: u32,
    /// LAN download ceiling in KB/s.
    pub max_lan_download_kbs: u32,
    /// Whether LAN-local connections are accounted against the LAN budgets
    /// instead of the global ones.
    pub lan_rate_enabled: bool,
    /// Whether the seeding-only upload ceiling may be applied at all.
    pub seeding_only_allowed: bool,

    /// TCP listening port for inbound connections.
    pub listen_port: u16,
    /// Local address to bind the listener to; `None` binds the wildcard.
    pub bind_address: Option<IpAddr>,
    /// SO_RCVBUF for the listening socket; `0` keeps the OS default.
    pub so_rcvbuf_size: usize,
    /// SO_SNDBUF applied to accepted sockets; `0` keeps the OS default.
    pub so_sndbuf_size: usize,
    /// IP type-of-service byte applied to accepted sockets.
    pub ip_tos: Option<u32>,

    /// Number of read scheduler instances. Read once at manager construction.
    pub read_scheduler_count: usize,
    /// Number of write scheduler instances. Read once at manager construction.
    pub write_scheduler_count: usize,

    /// Require the encrypted handshake on connections.
    pub require_crypto_handshake: bool,
    /// Allow plaintext fallback on inbound handshakes.
    pub incoming_crypto_fallback_allowed: bool,
    /// Allow plaintext fallback on outbound handshakes.
    pub outgoing_crypto_fallback_allowed: bool,
    /// Accept encrypted inbound handshakes at all.
    pub incoming_crypto_allowed: bool,

    /// Inflate the internal download ceiling to leave headroom for
    /// request-limiting admission control.
    pub use_request_limiting: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_upload_kbs: 0,
            max_upload_seeding_kbs: 0,
            max_download_kbs: 0,
            max_lan_upload_kbs: 0,
            max_lan_download_kbs: 0,
            lan_rate_enabled: false,
            seeding_only_allowed: false,
            listen_port: 6881,
            bind_address: None,
            so_rcvbuf_size: 0,
            so_sndbuf_size: 0,
            ip_tos: None,
            read_scheduler_count: 1,
            write_scheduler_count: 1,
            require_crypto_handshake: false,
            incoming_crypto_fallback_allowed: true,
            outgoing_crypto_fallback_allowed: true,
            incoming_crypto_allowed: true,
            use_request_limiting: false,
        }
    }
}

/// Publisher side of the live configuration. Clones share the same channel.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: watch::Sender<NetworkConfig>,
}

impl ConfigHandle {
    /// Create a handle with the given initial configuration.
    pub fn new(initial: NetworkConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Mutate the configuration in place and notify all observers.
    pub fn update(&self, mutate: impl FnOnce(&mut NetworkConfig)) {
        self.tx.send_modify(mutate);
    }

    /// Current configuration snapshot.
    pub fn current(&self) -> NetworkConfig {
        self.tx.borrow().clone()
    }

    /// Obtain an additional receiver.
    pub fn subscribe(&self) -> watch::Receiver<NetworkConfig> {
        self.tx.subscribe()
    }
}

//! The network manager façade.
//!
//! [`NetworkManager`] wires the admission, scheduling and rate layers
//! together and is the only type an application needs to hold. It owns:
//!
//! - one read and one write scheduler pool, sized once at construction;
//! - four standing transfer processors (upload, download and their LAN
//!   variants), each with its main budget backed by the live derived
//!   ceilings;
//! - the inbound match registry and accept loop;
//! - a task applying configuration updates to the derived rates.
//!
//! Connections move between the global and LAN processor pairs only at
//! registration time: ownership is discovered through the LAN upload
//! processor, so a connection always starts and stops on the same pair even
//! if the LAN rate setting flips in between.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use swarmnet_rate::RateBudget;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::admission::{Acceptor, MatchRegistry};
use crate::config::ConfigHandle;
use crate::connection::{
    ConnectParams, Connection, ConnectionListener, StreamDecoder, StreamEncoder, StreamFactory,
};
use crate::error::Result;
use crate::matcher::{ByteMatcher, MatchListener, RoutingData, RoutingListener};
use crate::processor::TransferProcessor;
use crate::rates::{EffectiveRates, GlobalRateGroup, TrafficClass};
use crate::scheduler::{IoScheduler, SchedulerDirection};
use crate::stats::{NetworkStats, NetworkStatsSnapshot};

/// Per-call override of the configured crypto requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoOverride {
    /// Follow the configured requirement.
    #[default]
    None,
    /// Require the encrypted handshake regardless of configuration.
    Required,
    /// Waive the encrypted handshake regardless of configuration.
    NotRequired,
}

/// Whether an address belongs to the local network for rate purposes:
/// loopback, RFC 1918 private, link-local, or IPv6 unique-local.
pub fn is_lan_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local()
        }
    }
}

/// Adapts a protocol owner's [`RoutingListener`] to the raw match callback:
/// wraps the accepted stream and its unconsumed prefix into a
/// [`Connection`] before handing it over.
struct RoutedMatchListener {
    listener: Arc<dyn RoutingListener>,
    factory: Arc<dyn StreamFactory>,
}

impl MatchListener for RoutedMatchListener {
    fn auto_crypto_fallback(&self) -> bool {
        self.listener.auto_crypto_fallback()
    }

    fn connection_matched(&self, stream: TcpStream, prefix: Vec<u8>, routing_data: RoutingData) {
        let peer = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!(error = %e, "matched stream lost its peer address");
                return;
            }
        };
        let conn = Connection::new_inbound(
            stream,
            peer,
            prefix,
            self.factory.create_encoder(),
            self.factory.create_decoder(),
        );
        conn.set_lan_local(is_lan_address(peer.ip()));
        self.listener.connection_routed(conn, routing_data);
    }
}

/// Admission and scheduling core for peer connections.
pub struct NetworkManager {
    config: ConfigHandle,
    rates: Arc<EffectiveRates>,
    stats: Arc<NetworkStats>,
    registry: Arc<MatchRegistry>,
    acceptor: Mutex<Option<Acceptor>>,
    read_pool: Vec<Arc<IoScheduler>>,
    write_pool: Vec<Arc<IoScheduler>>,
    upload: TransferProcessor,
    lan_upload: TransferProcessor,
    download: TransferProcessor,
    lan_download: TransferProcessor,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl NetworkManager {
    /// Build the manager from the current configuration. The scheduler pool
    /// sizes are read once here; later configuration updates to them are
    /// ignored with a warning.
    pub fn new(config: ConfigHandle) -> Arc<Self> {
        let cfg = config.current();
        let rates = Arc::new(EffectiveRates::new());
        rates.apply_config(&cfg);
        let stats = Arc::new(NetworkStats::default());

        let read_pool: Vec<_> = (0..cfg.read_scheduler_count.max(1))
            .map(|i| IoScheduler::new(SchedulerDirection::Read, i, Arc::clone(&stats)))
            .collect();
        let write_pool: Vec<_> = (0..cfg.write_scheduler_count.max(1))
            .map(|i| IoScheduler::new(SchedulerDirection::Write, i, Arc::clone(&stats)))
            .collect();

        let budget = |class: TrafficClass| {
            Arc::new(RateBudget::new(Arc::new(GlobalRateGroup::new(
                Arc::clone(&rates),
                class,
            ))))
        };

        Arc::new(Self {
            upload: TransferProcessor::new(
                TrafficClass::Upload,
                SchedulerDirection::Write,
                budget(TrafficClass::Upload),
                write_pool.clone(),
            ),
            lan_upload: TransferProcessor::new(
                TrafficClass::LanUpload,
                SchedulerDirection::Write,
                budget(TrafficClass::LanUpload),
                write_pool.clone(),
            ),
            download: TransferProcessor::new(
                TrafficClass::Download,
                SchedulerDirection::Read,
                budget(TrafficClass::Download),
                read_pool.clone(),
            ),
            lan_download: TransferProcessor::new(
                TrafficClass::LanDownload,
                SchedulerDirection::Read,
                budget(TrafficClass::LanDownload),
                read_pool.clone(),
            ),
            config,
            rates,
            stats,
            registry: Arc::new(MatchRegistry::new()),
            acceptor: Mutex::new(None),
            read_pool,
            write_pool,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Bind the listen socket and spawn the scheduler and configuration
    /// tasks. Idempotent. Must run inside a runtime.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let acceptor = match Acceptor::spawn(
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.stats),
        ) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(acceptor);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for scheduler in self.read_pool.iter().chain(self.write_pool.iter()) {
            tasks.push(scheduler.spawn());
        }

        let rates = Arc::clone(&self.rates);
        let mut rx = self.config.subscribe();
        let read_count = self.read_pool.len();
        let write_count = self.write_pool.len();
        tasks.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let cfg = rx.borrow_and_update().clone();
                rates.apply_config(&cfg);
                if cfg.read_scheduler_count.max(1) != read_count
                    || cfg.write_scheduler_count.max(1) != write_count
                {
                    tracing::warn!(
                        "scheduler pool sizes are fixed at construction, change ignored"
                    );
                }
            }
        }));
        tracing::info!("network manager started");
        Ok(())
    }

    /// Stop the accept loop and all spawned tasks. Registered connections
    /// are left to their owners to close.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(acceptor) = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            acceptor.shutdown();
        }
        for scheduler in self.read_pool.iter().chain(self.write_pool.iter()) {
            scheduler.shutdown();
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        tracing::info!("network manager stopped");
    }

    /// The live configuration handle.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Address the listen socket is currently bound to, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Acceptor::local_addr)
    }

    /// Snapshot of the transfer statistics.
    pub fn stats(&self) -> NetworkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Create an unconnected outbound connection. Call
    /// [`Connection::connect`] on the result to begin establishment, and
    /// [`NetworkManager::start_transfer_processing`] once it succeeds.
    #[allow(clippy::too_many_arguments)]
    pub fn create_connection(
        &self,
        target: SocketAddr,
        encoder: Box<dyn StreamEncoder>,
        decoder: Box<dyn StreamDecoder>,
        connect_with_crypto: bool,
        allow_fallback: bool,
        shared_secrets: Vec<Vec<u8>>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Connection> {
        let conn = Connection::new_outbound(
            target,
            encoder,
            decoder,
            ConnectParams {
                connect_with_crypto,
                allow_fallback,
                shared_secrets,
            },
            listener,
        );
        conn.set_lan_local(is_lan_address(target.ip()));
        conn
    }

    /// Wrap an externally established stream into a connection, bypassing
    /// admission. The owner installs its listener and starts transfer
    /// processing as with a routed connection.
    pub fn bind_transport(
        &self,
        stream: TcpStream,
        encoder: Box<dyn StreamEncoder>,
        decoder: Box<dyn StreamDecoder>,
    ) -> Result<Arc<Connection>> {
        let peer = stream.peer_addr()?;
        let conn = Connection::new_inbound(stream, peer, Vec::new(), encoder, decoder);
        conn.set_lan_local(is_lan_address(peer.ip()));
        Ok(conn)
    }

    /// Register interest in inbound connections whose first bytes match.
    /// Matched connections are delivered through the routing listener as
    /// ready [`Connection`]s carrying the unconsumed prefix.
    pub fn request_incoming_connection_routing(
        &self,
        matcher: Arc<dyn ByteMatcher>,
        listener: Arc<dyn RoutingListener>,
        factory: Arc<dyn StreamFactory>,
    ) {
        self.registry.register(
            matcher,
            Arc::new(RoutedMatchListener { listener, factory }),
        );
    }

    /// Withdraw a routing registration. Returns whether it was registered.
    pub fn cancel_incoming_connection_routing(&self, matcher: &Arc<dyn ByteMatcher>) -> bool {
        self.registry.deregister(matcher)
    }

    /// Put both directions of a connection under rate-controlled transfer
    /// processing. A LAN-local connection goes on the LAN pair when LAN
    /// rates are enabled, otherwise on the global pair.
    pub fn start_transfer_processing(&self, conn: &Arc<Connection>) {
        if conn.is_lan_local() && self.rates.is_lan_rate_enabled() {
            self.lan_upload.register(conn);
            self.lan_download.register(conn);
        } else {
            self.upload.register(conn);
            self.download.register(conn);
        }
    }

    /// Take both directions out of transfer processing. Ownership is
    /// discovered through the LAN upload processor, so the connection comes
    /// off the pair it was registered on. Idempotent.
    pub fn stop_transfer_processing(&self, conn: &Arc<Connection>) {
        if self.lan_upload.is_registered(conn.id()) {
            self.lan_upload.deregister(conn.id());
            self.lan_download.deregister(conn.id());
        } else {
            self.upload.deregister(conn.id());
            self.download.deregister(conn.id());
        }
    }

    /// Move both directions onto the partitioned schedulers selected by the
    /// hint. No-op when the connection is not under transfer processing.
    pub fn upgrade_transfer_processing(&self, conn: &Arc<Connection>, partition_id: i32) {
        if self.lan_upload.is_registered(conn.id()) {
            self.lan_upload.upgrade(conn, partition_id);
            self.lan_download.upgrade(conn, partition_id);
        } else {
            self.upload.upgrade(conn, partition_id);
            self.download.upgrade(conn, partition_id);
        }
    }

    /// Move both directions back onto the default schedulers.
    pub fn downgrade_transfer_processing(&self, conn: &Arc<Connection>) {
        if self.lan_upload.is_registered(conn.id()) {
            self.lan_upload.downgrade(conn);
            self.lan_download.downgrade(conn);
        } else {
            self.upload.downgrade(conn);
            self.download.downgrade(conn);
        }
    }

    /// Attach a supplementary budget to one direction of a connection under
    /// transfer processing. The direction's per-cycle allowance becomes the
    /// minimum across its attached budgets.
    pub fn add_rate_limiter(&self, conn: &Arc<Connection>, budget: Arc<RateBudget>, upload: bool) {
        if upload {
            if self.lan_upload.is_registered(conn.id()) {
                self.lan_upload.add_rate_limiter(conn.id(), budget);
            } else {
                self.upload.add_rate_limiter(conn.id(), budget);
            }
        } else if self.lan_download.is_registered(conn.id()) {
            self.lan_download.add_rate_limiter(conn.id(), budget);
        } else {
            self.download.add_rate_limiter(conn.id(), budget);
        }
    }

    /// Detach a supplementary budget from one direction of a connection.
    pub fn remove_rate_limiter(
        &self,
        conn: &Arc<Connection>,
        budget: &Arc<RateBudget>,
        upload: bool,
    ) {
        if upload {
            if self.lan_upload.is_registered(conn.id()) {
                self.lan_upload.remove_rate_limiter(conn.id(), budget);
            } else {
                self.upload.remove_rate_limiter(conn.id(), budget);
            }
        } else if self.lan_download.is_registered(conn.id()) {
            self.lan_download.remove_rate_limiter(conn.id(), budget);
        } else {
            self.download.remove_rate_limiter(conn.id(), budget);
        }
    }

    /// Switch between the normal and the seeding-only upload ceiling.
    pub fn set_seeding_only(&self, seeding_only: bool) {
        self.rates.set_seeding_only(seeding_only);
    }

    /// Whether the seeding-only upload ceiling is currently in force.
    pub fn is_seeding_only_upload_rate(&self) -> bool {
        self.rates.is_seeding_only_upload_rate()
    }

    /// Configured upload ceiling in bytes per second, `0` when unlimited.
    pub fn upload_rate_bps_normal(&self) -> u32 {
        self.rates.max_upload_rate_bps_normal()
    }

    /// Configured seeding-only upload ceiling in bytes per second, `0` when
    /// unlimited.
    pub fn upload_rate_bps_seeding_only(&self) -> u32 {
        self.rates.max_upload_rate_bps_seeding_only()
    }

    /// Configured download ceiling in bytes per second, `0` when unlimited.
    /// The internally enforced ceiling may run slightly hotter when
    /// request-limiting admission control is enabled.
    pub fn download_rate_bps(&self) -> u32 {
        self.rates.max_download_rate_bps()
    }

    /// Whether a connection must use the encrypted handshake, applying a
    /// per-call override on top of the configured requirement.
    pub fn crypto_required(&self, level: CryptoOverride) -> bool {
        match level {
            CryptoOverride::Required => true,
            CryptoOverride::NotRequired => false,
            CryptoOverride::None => self.config.current().require_crypto_handshake,
        }
    }

    /// Whether encrypted inbound handshakes are accepted at all.
    pub fn incoming_crypto_allowed(&self) -> bool {
        self.config.current().incoming_crypto_allowed
    }

    /// Whether an inbound peer that fails the encrypted handshake may retry
    /// in the clear.
    pub fn incoming_crypto_fallback_allowed(&self) -> bool {
        self.config.current().incoming_crypto_fallback_allowed
    }

    /// Whether an outbound encrypted handshake failure may fall back to a
    /// plain connection.
    pub fn outgoing_crypto_fallback_allowed(&self) -> bool {
        self.config.current().outgoing_crypto_fallback_allowed
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::connection::{RawStreamDecoder, RawStreamEncoder};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    fn manager_with(cfg: NetworkConfig) -> Arc<NetworkManager> {
        NetworkManager::new(ConfigHandle::new(cfg))
    }

    async fn inbound_conn() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        Connection::new_inbound(
            server,
            peer,
            Vec::new(),
            Box::new(RawStreamEncoder),
            Box::new(RawStreamDecoder),
        )
    }

    #[test]
    fn lan_address_classification() {
        assert!(is_lan_address(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_lan_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))));
        assert!(is_lan_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_lan_address(IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1))));
        assert!(!is_lan_address(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(is_lan_address(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_lan_address(IpAddr::V6(Ipv6Addr::new(
            0x2001, 0xdb8, 0, 0, 0, 0, 0, 1
        ))));
    }

    #[tokio::test]
    async fn global_pair_is_used_for_wan_connections() {
        let m = manager_with(NetworkConfig {
            lan_rate_enabled: true,
            ..NetworkConfig::default()
        });
        let conn = inbound_conn().await;
        conn.set_lan_local(false);

        m.start_transfer_processing(&conn);
        assert!(m.upload.is_registered(conn.id()));
        assert!(m.download.is_registered(conn.id()));
        assert!(!m.lan_upload.is_registered(conn.id()));

        m.stop_transfer_processing(&conn);
        assert!(!m.upload.is_registered(conn.id()));
        assert!(!m.download.is_registered(conn.id()));
    }

    #[tokio::test]
    async fn lan_pair_is_used_when_enabled() {
        let m = manager_with(NetworkConfig {
            lan_rate_enabled: true,
            ..NetworkConfig::default()
        });
        let conn = inbound_conn().await;
        conn.set_lan_local(true);

        m.start_transfer_processing(&conn);
        assert!(m.lan_upload.is_registered(conn.id()));
        assert!(m.lan_download.is_registered(conn.id()));
        assert!(!m.upload.is_registered(conn.id()));

        m.stop_transfer_processing(&conn);
        assert!(!m.lan_upload.is_registered(conn.id()));
        assert!(!m.lan_download.is_registered(conn.id()));
    }

    #[tokio::test]
    async fn lan_local_connection_uses_global_pair_when_lan_rates_disabled() {
        let m = manager_with(NetworkConfig::default());
        let conn = inbound_conn().await;
        conn.set_lan_local(true);

        m.start_transfer_processing(&conn);
        assert!(m.upload.is_registered(conn.id()));
        assert!(!m.lan_upload.is_registered(conn.id()));
        m.stop_transfer_processing(&conn);
    }

    #[tokio::test]
    async fn stop_finds_the_owning_pair_after_setting_flips() {
        let m = manager_with(NetworkConfig {
            lan_rate_enabled: true,
            ..NetworkConfig::default()
        });
        let conn = inbound_conn().await;
        conn.set_lan_local(true);
        m.start_transfer_processing(&conn);

        // The setting flips while the connection is registered; stop must
        // still come off the LAN pair.
        m.config().update(|c| c.lan_rate_enabled = false);
        m.rates.apply_config(&m.config().current());
        m.stop_transfer_processing(&conn);
        assert!(!m.lan_upload.is_registered(conn.id()));
        assert!(!m.lan_download.is_registered(conn.id()));
        assert!(!m.upload.is_registered(conn.id()));
    }

    #[tokio::test]
    async fn upgrade_and_downgrade_follow_ownership() {
        let m = manager_with(NetworkConfig {
            read_scheduler_count: 3,
            write_scheduler_count: 3,
            ..NetworkConfig::default()
        });
        let conn = inbound_conn().await;
        m.start_transfer_processing(&conn);

        m.upgrade_transfer_processing(&conn, 4);
        assert_eq!(conn.partition_id(), 4);
        let expected = (4usize % 2) + 1;
        assert!(m.write_pool[expected].contains(conn.id()));
        assert!(m.read_pool[expected].contains(conn.id()));

        m.downgrade_transfer_processing(&conn);
        assert!(m.write_pool[0].contains(conn.id()));
        assert!(m.read_pool[0].contains(conn.id()));
        m.stop_transfer_processing(&conn);
    }

    #[test]
    fn crypto_override_levels() {
        let m = manager_with(NetworkConfig {
            require_crypto_handshake: true,
            ..NetworkConfig::default()
        });
        assert!(m.crypto_required(CryptoOverride::None));
        assert!(m.crypto_required(CryptoOverride::Required));
        assert!(!m.crypto_required(CryptoOverride::NotRequired));

        m.config().update(|c| c.require_crypto_handshake = false);
        assert!(!m.crypto_required(CryptoOverride::None));
        assert!(m.crypto_required(CryptoOverride::Required));
    }

    #[test]
    fn crypto_flag_accessors_track_config() {
        let m = manager_with(NetworkConfig::default());
        assert!(m.incoming_crypto_allowed());
        assert!(m.incoming_crypto_fallback_allowed());
        assert!(m.outgoing_crypto_fallback_allowed());

        m.config().update(|c| {
            c.incoming_crypto_allowed = false;
            c.incoming_crypto_fallback_allowed = false;
            c.outgoing_crypto_fallback_allowed = false;
        });
        assert!(!m.incoming_crypto_allowed());
        assert!(!m.incoming_crypto_fallback_allowed());
        assert!(!m.outgoing_crypto_fallback_allowed());
    }

    #[test]
    fn display_rates_and_seeding_toggle() {
        let m = manager_with(NetworkConfig {
            max_upload_kbs: 100,
            max_upload_seeding_kbs: 20,
            max_download_kbs: 0,
            seeding_only_allowed: true,
            ..NetworkConfig::default()
        });
        assert_eq!(m.upload_rate_bps_normal(), 100 * 1024);
        assert_eq!(m.upload_rate_bps_seeding_only(), 20 * 1024);
        assert_eq!(m.download_rate_bps(), 0);

        assert!(!m.is_seeding_only_upload_rate());
        m.set_seeding_only(true);
        assert!(m.is_seeding_only_upload_rate());
    }

    #[tokio::test]
    async fn outbound_connection_is_classified_lan_local() {
        let m = manager_with(NetworkConfig::default());
        struct Quiet;
        impl ConnectionListener for Quiet {
            fn message_received(&self, _message: Vec<u8>) {}
        }
        let conn = m.create_connection(
            "192.168.0.9:6881".parse().unwrap(),
            Box::new(RawStreamEncoder),
            Box::new(RawStreamDecoder),
            false,
            true,
            Vec::new(),
            Arc::new(Quiet),
        );
        assert!(conn.is_lan_local());

        let wan = m.create_connection(
            "8.8.8.8:6881".parse().unwrap(),
            Box::new(RawStreamEncoder),
            Box::new(RawStreamDecoder),
            false,
            true,
            Vec::new(),
            Arc::new(Quiet),
        );
        assert!(!wan.is_lan_local());
    }

    #[tokio::test]
    async fn config_update_reaches_derived_rates() {
        let m = manager_with(NetworkConfig {
            listen_port: 0,
            max_upload_kbs: 100,
            ..NetworkConfig::default()
        });
        m.start().unwrap();
        assert!(m.listen_addr().is_some());
        assert_eq!(m.upload_rate_bps_normal(), 100 * 1024);

        m.config().update(|c| c.max_upload_kbs = 10);
        tokio::time::timeout(Duration::from_secs(2), async {
            while m.upload_rate_bps_normal() != 10 * 1024 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rate update not applied");

        m.shutdown();
        m.shutdown(); // idempotent
        assert!(m.listen_addr().is_none());
    }

    #[tokio::test]
    async fn bound_transport_is_a_ready_connection() {
        let m = manager_with(NetworkConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let conn = m
            .bind_transport(
                server,
                Box::new(RawStreamEncoder),
                Box::new(RawStreamDecoder),
            )
            .unwrap();
        assert!(conn.is_lan_local());
        m.start_transfer_processing(&conn);
        assert!(m.upload.is_registered(conn.id()));
        m.stop_transfer_processing(&conn);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let m = manager_with(NetworkConfig {
            listen_port: 0,
            ..NetworkConfig::default()
        });
        m.start().unwrap();
        let addr = m.listen_addr();
        m.start().unwrap();
        assert_eq!(m.listen_addr(), addr);
        m.shutdown();
    }
}

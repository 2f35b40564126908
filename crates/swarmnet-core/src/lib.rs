//! Admission and scheduling core for peer connections.
//!
//! This crate is the network front of a swarm transfer engine. It accepts
//! inbound connections, routes them to protocol owners by their first bytes,
//! and drives all registered connections through rate-limited non-blocking
//! I/O schedulers:
//!
//! - [`NetworkManager`]: the façade an application holds;
//! - [`Connection`]: one logical peer connection with its codec pair;
//! - [`ByteMatcher`] / [`RoutingListener`]: inbound signature routing;
//! - [`NetworkConfig`] / [`ConfigHandle`]: hot-reloadable configuration;
//! - upload/download ceilings, with LAN variants and a seeding-only upload
//!   mode, enforced as global token budgets shared by all connections.
//!
//! The core moves bytes; it never interprets them. Message framing belongs
//! to the [`StreamEncoder`] / [`StreamDecoder`] implementations a protocol
//! owner supplies, and everything above the wire (handshakes, choking,
//! piece picking) lives in the owner's code.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod admission;
mod config;
mod connection;
mod error;
mod manager;
mod matcher;
mod processor;
mod rates;
mod scheduler;
mod stats;

pub use config::{ConfigHandle, NetworkConfig};
pub use connection::{
    ConnectParams, Connection, ConnectionId, ConnectionListener, RawStreamDecoder,
    RawStreamEncoder, RawStreamFactory, StreamDecoder, StreamEncoder, StreamFactory,
};
pub use error::{NetError, Result};
pub use manager::{CryptoOverride, NetworkManager, is_lan_address};
pub use matcher::{ByteMatcher, MatchListener, PrefixMatcher, RoutingData, RoutingListener};
pub use stats::{NetworkStats, NetworkStatsSnapshot};

pub use swarmnet_rate::{FixedRateGroup, RateBudget, RateGroup, UNLIMITED_RATE};

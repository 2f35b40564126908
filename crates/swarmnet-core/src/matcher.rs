//! Byte-signature matching for inbound connection routing.
//!
//! A protocol owner registers a [`ByteMatcher`] describing the byte prefix it
//! recognizes. The admission registry buffers a new connection's first bytes
//! and consults every registered matcher, in registration order, after each
//! read. The first matcher to return routing data wins, so registration
//! order is a priority order among overlapping signatures.

use std::any::Any;
use std::sync::Arc;

use tokio::net::TcpStream;

/// Opaque routing payload handed from a matcher to its owner's callback.
pub type RoutingData = Box<dyn Any + Send + Sync>;

/// Byte stream match filter for routing.
pub trait ByteMatcher: Send + Sync {
    /// Minimum buffered bytes before [`ByteMatcher::min_matches`] is
    /// consulted for an early partial match.
    fn min_size(&self) -> usize;

    /// Maximum number of bytes this matcher requires. A connection that fails
    /// to match with this many bytes buffered (across all matchers) is
    /// dropped.
    fn max_size(&self) -> usize;

    /// Buffered-byte count at or beyond which [`ByteMatcher::matches`] is
    /// consulted for the full check.
    fn match_this_size_or_bigger(&self) -> usize;

    /// Full check once `match_this_size_or_bigger` bytes are available.
    /// Returns routing data on a match.
    fn matches(&self, buffer: &[u8], local_port: u16) -> Option<RoutingData>;

    /// Early partial check once `min_size` bytes are available. Returns
    /// routing data on a match.
    fn min_matches(&self, buffer: &[u8], local_port: u16) -> Option<RoutingData>;

    /// Shared secrets for the crypto handshake wrapper, if any.
    fn shared_secrets(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Restrict this matcher to connections accepted on a specific local
    /// port, `None` for any.
    fn specific_port(&self) -> Option<u16> {
        None
    }
}

/// Low-level listener invoked by the admission registry on a signature match.
///
/// Receives the raw accepted stream together with the buffered prefix bytes,
/// unconsumed. The manager installs an adapter that wraps these into a
/// [`crate::Connection`] before invoking the owner's [`RoutingListener`].
pub trait MatchListener: Send + Sync {
    /// Whether transports that failed the crypto handshake may fall back to
    /// plaintext for this owner.
    fn auto_crypto_fallback(&self) -> bool {
        true
    }

    /// The given accepted stream matched this owner's signature.
    fn connection_matched(&self, stream: TcpStream, prefix: Vec<u8>, routing_data: RoutingData);
}

/// Protocol-owner listener for routed inbound connections.
pub trait RoutingListener: Send + Sync {
    /// Whether transports that failed the crypto handshake may fall back to
    /// plaintext for this owner.
    fn auto_crypto_fallback(&self) -> bool {
        true
    }

    /// Invoked exactly once per matched connection with a ready logical
    /// connection and the matcher's routing data.
    fn connection_routed(&self, connection: Arc<crate::Connection>, routing_data: RoutingData);
}

/// Convenience matcher recognizing a fixed byte prefix.
///
/// `min_matches` succeeds on any strict prefix of the signature, so owners
/// of long signatures can claim a connection early.
pub struct PrefixMatcher {
    signature: Vec<u8>,
}

impl PrefixMatcher {
    /// Create a matcher for the given signature bytes.
    pub fn new(signature: impl Into<Vec<u8>>) -> Self {
        Self {
            signature: signature.into(),
        }
    }
}

impl ByteMatcher for PrefixMatcher {
    fn min_size(&self) -> usize {
        self.signature.len()
    }

    fn max_size(&self) -> usize {
        self.signature.len()
    }

    fn match_this_size_or_bigger(&self) -> usize {
        self.signature.len()
    }

    fn matches(&self, buffer: &[u8], _local_port: u16) -> Option<RoutingData> {
        if buffer.len() >= self.signature.len() && buffer[..self.signature.len()] == self.signature
        {
            Some(Box::new(()))
        } else {
            None
        }
    }

    fn min_matches(&self, buffer: &[u8], local_port: u16) -> Option<RoutingData> {
        self.matches(buffer, local_port)
    }
}

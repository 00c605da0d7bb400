//! Error types for the gateway.

use amt_core::CodecError;
use amt_transport::TransportError;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Handshake step a relay failed to answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Waiting for a Relay Advertisement after Discovery
    Advertisement,
    /// Waiting for a Membership Query after Request
    MembershipQuery,
    /// Waiting for the first Multicast Data after joining
    MulticastData,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertisement => write!(f, "relay advertisement"),
            Self::MembershipQuery => write!(f, "membership query"),
            Self::MulticastData => write!(f, "multicast data"),
        }
    }
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Relay name resolved to no IPv4 address
    #[error("no relay candidates for '{relay}': {reason}")]
    ResolutionFailure {
        /// Configured relay string
        relay: String,
        /// Resolver message
        reason: String,
    },

    /// Relay did not answer in time
    #[error("timed out waiting for {stage} from {relay}")]
    HandshakeTimeout {
        /// Step that timed out
        stage: HandshakeStage,
        /// Relay address waited on
        relay: SocketAddr,
    },

    /// Relay answered with the wrong message or nonce
    #[error("protocol error from relay {relay}: {source}")]
    HandshakeProtocol {
        /// Relay that sent the message
        relay: SocketAddr,
        /// Decoding failure
        source: CodecError,
    },

    /// Relay port is closed (ICMP port unreachable)
    #[error("relay {relay} refused the connection")]
    RelayUnreachable {
        /// Relay address
        relay: SocketAddr,
    },

    /// Every relay candidate failed
    #[error("all {attempted} relay candidates failed")]
    AllCandidatesExhausted {
        /// Number of candidates tried
        attempted: usize,
    },

    /// Socket error
    #[error("socket error: {0}")]
    Socket(#[from] TransportError),

    /// No data arrived on the tunnel; the stream has ended
    #[error("no data from relay for {0:?}")]
    TunnelTimeout(Duration),

    /// Stream locator could not be parsed
    #[error("invalid stream locator: {0}")]
    InvalidLocator(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session has been closed or has ended
    #[error("session closed")]
    Closed,
}

impl GatewayError {
    /// Whether the error ends the stream.
    ///
    /// Per-candidate failures only move the handshake on to the next relay.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::HandshakeProtocol { .. }
                | Self::RelayUnreachable { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Socket(TransportError::Io(err))
    }
}

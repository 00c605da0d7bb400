//! Transport errors and the native socket seam.
//!
//! The gateway never creates native multicast sockets itself. It asks a
//! [`DatagramOpener`], so an embedding application (or a test) decides how
//! the plain receive path is set up.

use amt_core::Subscription;
use async_trait::async_trait;
use std::io;
use tokio::net::UdpSocket;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket creation or binding failed
    #[error("Failed to bind socket: {0}")]
    BindFailed(String),

    /// Group join or leave was refused by the OS
    #[error("Membership change for {subscription} failed: {error}")]
    Membership {
        /// Subscription being joined or left
        subscription: Subscription,
        /// OS error
        #[source]
        error: io::Error,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Creates the native multicast socket for a subscription.
///
/// The returned socket must already be bound and joined so that datagrams
/// sent to the group arrive on it.
#[async_trait]
pub trait DatagramOpener: Send + Sync {
    /// Open a socket receiving `subscription` on UDP `port`
    ///
    /// # Errors
    /// Returns `TransportError` if the socket cannot be created, bound or joined
    async fn open_native(&self, subscription: &Subscription, port: u16)
    -> TransportResult<UdpSocket>;
}

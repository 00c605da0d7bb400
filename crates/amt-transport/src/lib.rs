//! # AMT Transport
//!
//! Socket layer for the AMT gateway.
//!
//! This crate provides:
//! - The tunnel socket used for relay control and encapsulated data
//! - Native multicast sockets behind the [`DatagramOpener`] seam
//! - OS-level ASM/SSM group membership on either kind of socket

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod membership;
pub mod transport;
pub mod udp;

pub use membership::GroupMembership;
pub use transport::{DatagramOpener, TransportError, TransportResult};
pub use udp::{MulticastOpener, TunnelSocket};

use std::net::{Ipv4Addr, SocketAddr};

/// Socket configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Local address the tunnel socket binds to
    pub bind_addr: SocketAddr,
    /// Local interface used for group joins
    pub interface: Ipv4Addr,
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            interface: Ipv4Addr::UNSPECIFIED,
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 256 * 1024,
        }
    }
}

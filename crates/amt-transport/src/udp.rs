//! UDP sockets for the gateway.
//!
//! Both socket kinds are built with `socket2` so buffer sizes and address
//! reuse can be set before binding, then handed to Tokio.

use crate::SocketConfig;
use crate::membership::GroupMembership;
use crate::transport::{DatagramOpener, TransportError, TransportResult};
use amt_core::Subscription;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

fn new_udp_socket(config: &SocketConfig) -> TransportResult<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    Ok(socket)
}

fn into_tokio(socket: Socket) -> TransportResult<UdpSocket> {
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| TransportError::BindFailed(e.to_string()))
}

/// Socket carrying the AMT exchange with one relay.
///
/// Unconnected during discovery, then connected to the advertised relay so
/// the kernel drops datagrams from any other peer.
#[derive(Debug)]
pub struct TunnelSocket {
    socket: UdpSocket,
}

impl TunnelSocket {
    /// Bind a new tunnel socket to `config.bind_addr`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be set up
    pub fn bind(config: &SocketConfig) -> TransportResult<Self> {
        let socket = new_udp_socket(config)?;
        socket
            .bind(&config.bind_addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{}: {e}", config.bind_addr)))?;
        let socket = into_tokio(socket)?;

        debug!("Tunnel socket bound to {:?}", socket.local_addr().ok());
        Ok(Self { socket })
    }

    /// Restrict traffic to `relay`
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the connect fails
    pub async fn connect(&self, relay: SocketAddr) -> TransportResult<()> {
        self.socket.connect(relay).await?;
        debug!("Tunnel socket connected to {relay}");
        Ok(())
    }

    /// Send to an explicit address (discovery)
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the send fails
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        let sent = self.socket.send_to(buf, addr).await?;
        trace!("Sent {sent} bytes to {addr}");
        Ok(sent)
    }

    /// Send to the connected relay
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the send fails or the socket is unconnected
    pub async fn send(&self, buf: &[u8]) -> TransportResult<usize> {
        let sent = self.socket.send(buf).await?;
        trace!("Sent {sent} bytes to relay");
        Ok(sent)
    }

    /// Send to the connected relay without waiting, for use outside async
    /// contexts
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the socket is not ready or the send fails
    pub fn try_send(&self, buf: &[u8]) -> TransportResult<usize> {
        let sent = self.socket.try_send(buf)?;
        trace!("Sent {sent} bytes to relay");
        Ok(sent)
    }

    /// Receive one datagram and its sender
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the receive fails
    pub async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    /// Receive one datagram
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the receive fails
    pub async fn recv(&self, buf: &mut [u8]) -> TransportResult<usize> {
        self.recv_from(buf).await.map(|(size, _)| size)
    }

    /// Local address of the socket
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the address cannot be determined
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Underlying Tokio socket, for socket options such as group membership
    #[must_use]
    pub fn as_udp(&self) -> &UdpSocket {
        &self.socket
    }
}

/// Default [`DatagramOpener`]: binds the group port on all addresses and
/// joins the subscription on the configured interface.
#[derive(Debug, Clone, Default)]
pub struct MulticastOpener {
    config: SocketConfig,
}

impl MulticastOpener {
    /// Create an opener using `config` for buffers and the join interface
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DatagramOpener for MulticastOpener {
    async fn open_native(
        &self,
        subscription: &Subscription,
        port: u16,
    ) -> TransportResult<UdpSocket> {
        let socket = new_udp_socket(&self.config)?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let socket = into_tokio(socket)?;

        // The OS drops the membership when the socket closes
        GroupMembership::new(*subscription, self.config.interface).join(&socket)?;

        debug!("Native socket for {subscription} listening on {addr}");
        Ok(socket)
    }
}

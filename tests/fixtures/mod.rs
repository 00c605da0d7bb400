//! Test fixtures: a mock AMT relay and a loopback native socket opener.

mod mock_relay;

pub use mock_relay::{
    Behavior, MockRelay, RelayEvent, RelayOptions, RelaySpec, TRUNCATED_LEN, payload_for,
};

use amt_core::Subscription;
use amt_transport::{DatagramOpener, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::UdpSocket;

/// Stands in for the native multicast socket: a plain loopback socket
/// whose address tests can send "multicast" datagrams to.
#[derive(Debug, Default)]
pub struct LoopbackOpener {
    addr: Mutex<Option<SocketAddr>>,
}

impl LoopbackOpener {
    /// Address of the last socket opened
    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr.lock().ok().and_then(|addr| *addr)
    }
}

#[async_trait]
impl DatagramOpener for LoopbackOpener {
    async fn open_native(
        &self,
        _subscription: &Subscription,
        _port: u16,
    ) -> TransportResult<UdpSocket> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        if let Ok(mut addr) = self.addr.lock() {
            *addr = Some(socket.local_addr()?);
        }
        Ok(socket)
    }
}

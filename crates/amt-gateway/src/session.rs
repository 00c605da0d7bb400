//! Receive session for one multicast stream.
//!
//! A session starts on the native multicast path. If nothing arrives within
//! the native timeout it resolves the relay, brings a tunnel up and keeps
//! reading from the tunnel from then on. The switch happens at most once:
//! a silent tunnel ends the stream rather than falling back.

use crate::config::{GatewayConfig, StreamLocator};
use crate::error::GatewayError;
use crate::handshake::{HandshakeEngine, deadline_after};
use crate::resolver::RelayResolver;
use crate::stats::{SessionCounters, SessionStats};
use crate::tunnel::{Received, TUNNEL_BUF_LEN, Tunnel};
use amt_core::{NonceGenerator, ResponseMac, TimeSeededNonce};
use amt_transport::{DatagramOpener, MulticastOpener, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Current receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reading plain multicast from the local network
    Native,
    /// Reading Multicast Data from an AMT relay
    Tunneled,
}

/// One received UDP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Payload bytes
    pub data: Vec<u8>,
    /// The datagram was cut short: larger than the expected MTU, or
    /// tunneled data ending inside its headers
    pub corrupted: bool,
}

/// A multicast subscription delivering payloads to the caller
pub struct Session {
    config: GatewayConfig,
    locator: StreamLocator,
    engine: HandshakeEngine,
    native: Option<UdpSocket>,
    tunnel: Option<Tunnel>,
    mode: Mode,
    mtu: usize,
    buf: Vec<u8>,
    counters: Arc<SessionCounters>,
    ended: bool,
}

impl Session {
    /// Open a session with the default socket opener and nonce source
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidConfig` for an unusable configuration
    pub async fn open(config: GatewayConfig, locator: StreamLocator) -> Result<Self, GatewayError> {
        let opener = MulticastOpener::new(config.socket_config());
        Self::open_with(config, locator, &opener, Box::new(TimeSeededNonce::new())).await
    }

    /// Open a session using `opener` for the native socket and `nonces`
    /// for the handshake.
    ///
    /// If the native socket cannot be opened the session starts out
    /// without one and tunnels on the first receive.
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidConfig` for an unusable configuration
    pub async fn open_with(
        config: GatewayConfig,
        locator: StreamLocator,
        opener: &dyn DatagramOpener,
        nonces: Box<dyn NonceGenerator>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let native = match opener.open_native(&locator.subscription, locator.port).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("Native multicast unavailable for {locator}: {e}");
                None
            }
        };

        info!("Session opened for {locator}");
        Ok(Self {
            engine: HandshakeEngine::new(&config, nonces),
            mtu: config.mtu,
            config,
            locator,
            native,
            tunnel: None,
            mode: Mode::Native,
            buf: vec![0u8; TUNNEL_BUF_LEN],
            counters: Arc::new(SessionCounters::default()),
            ended: false,
        })
    }

    /// Current receive path
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Expected payload size
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Stream this session receives
    #[must_use]
    pub fn locator(&self) -> &StreamLocator {
        &self.locator
    }

    /// Relay in use, once tunneled
    #[must_use]
    pub fn relay(&self) -> Option<SocketAddr> {
        self.tunnel.as_ref().map(Tunnel::relay)
    }

    /// Relay MAC in use, once tunneled
    #[must_use]
    pub fn relay_mac(&self) -> Option<ResponseMac> {
        self.tunnel.as_ref().map(Tunnel::mac)
    }

    /// Refresh interval in use, once tunneled
    #[must_use]
    pub fn query_interval(&self) -> Option<Duration> {
        self.tunnel.as_ref().map(Tunnel::query_interval)
    }

    /// Counters for this session
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Receive the next payload.
    ///
    /// Dropping the returned future while a tunnel is being brought up
    /// (e.g. losing a `select!`) abandons that tunnel: its refresh task is
    /// aborted and the leave update goes out without waiting. The next call
    /// starts bring-up over from the relay candidates.
    ///
    /// # Errors
    /// `TunnelTimeout` ends the stream; after it, or after any other fatal
    /// error, every call returns `Closed`
    pub async fn recv(&mut self) -> Result<Block, GatewayError> {
        if self.ended {
            return Err(GatewayError::Closed);
        }

        let result = match self.mode {
            Mode::Native => match self.recv_native().await {
                Ok(Some(block)) => Ok(block),
                Ok(None) => match self.switch_to_tunnel().await {
                    Ok(()) => self.recv_tunneled().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },
            Mode::Tunneled => self.recv_tunneled().await,
        };

        if let Err(e) = &result {
            debug!("Stream {} ended: {e}", self.locator);
            self.ended = true;
        }
        result
    }

    /// One native datagram, or `None` when the native path timed out
    async fn recv_native(&mut self) -> Result<Option<Block>, GatewayError> {
        let Some(socket) = self.native.as_ref() else {
            return Ok(None);
        };

        let len = match timeout(self.config.native_timeout, socket.recv(&mut self.buf)).await {
            Ok(result) => result.map_err(TransportError::Io)?,
            Err(_) => {
                info!(
                    "No native multicast for {} within {:?}",
                    self.locator, self.config.native_timeout
                );
                return Ok(None);
            }
        };

        let mut corrupted = false;
        let mut keep = len;
        if len > self.mtu {
            warn!(
                "{len} bytes packet truncated (MTU was {})",
                self.mtu
            );
            self.counters.record_truncated();
            corrupted = true;
            keep = self.mtu;
            self.mtu = len;
        }

        self.counters.record_native(keep);
        Ok(Some(Block {
            data: self.buf[..keep].to_vec(),
            corrupted,
        }))
    }

    async fn switch_to_tunnel(&mut self) -> Result<(), GatewayError> {
        // Closing the native socket drops its membership
        self.native = None;

        let resolver = RelayResolver::new(self.config.relay_port);
        let candidates = resolver.resolve_all(self.config.relays()).await?;
        info!(
            "Switching {} to AMT, relay candidates {candidates:?}",
            self.locator
        );

        let tunnel = Tunnel::establish(
            &self.config,
            self.locator.subscription,
            &candidates,
            &mut self.engine,
            Arc::clone(&self.counters),
        )
        .await?;

        self.tunnel = Some(tunnel);
        self.mode = Mode::Tunneled;
        Ok(())
    }

    async fn recv_tunneled(&mut self) -> Result<Block, GatewayError> {
        let tunnel = self.tunnel.as_mut().ok_or(GatewayError::Closed)?;

        if let Some(block) = tunnel.take_first_block() {
            self.counters.record_tunnel(block.data.len());
            return Ok(block);
        }

        // Skipped datagrams do not extend the wait
        let deadline = deadline_after(self.config.amt_timeout);
        loop {
            let len = tunnel
                .recv_until(&mut self.buf, deadline)
                .await
                .map_err(|e| match e {
                    GatewayError::TunnelTimeout(_) => {
                        GatewayError::TunnelTimeout(self.config.amt_timeout)
                    }
                    other => other,
                })?;

            let (payload, corrupted) = match tunnel.classify(&self.buf[..len]).await {
                Received::Data(payload) => (payload, false),
                Received::Truncated(payload) => (payload, true),
                Received::Other => continue,
            };
            self.counters.record_tunnel(payload.len());
            return Ok(Block {
                data: payload.to_vec(),
                corrupted,
            });
        }
    }

    /// Tear the session down.
    ///
    /// When tunneled: stop the refresh task, send the leave update, leave
    /// the group, then close the sockets.
    pub async fn close(mut self) -> SessionStats {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
        self.native = None;
        self.ended = true;

        let stats = self.counters.snapshot();
        info!(
            "Session for {} closed: {} datagrams, {} bytes",
            self.locator,
            stats.total_datagrams(),
            stats.total_bytes()
        );
        stats
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("locator", &self.locator)
            .field("mode", &self.mode)
            .field("mtu", &self.mtu)
            .field("tunnel", &self.tunnel)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

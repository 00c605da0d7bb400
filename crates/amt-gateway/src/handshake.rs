//! AMT handshake against a single relay candidate.
//!
//! ```text
//! Idle ─▶ DiscoverySent ─▶ AdvertisementReceived ─▶ RequestSent ─▶ QueryReceived
//!  ▲            │                                        │
//!  └────────────┴──────── timeout / wrong type / nonce ──┘
//! ```
//!
//! Every wait is bounded: the advertisement by the native timeout, the
//! membership query by the AMT timeout. Nothing is resent; a failed step
//! abandons the candidate.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, HandshakeStage};
use amt_core::{
    CodecError, MembershipQuery, NonceGenerator, RelayAdvertisement, RelayDiscovery,
    RelayRequest, ResponseMac,
};
use amt_transport::{TransportError, TunnelSocket};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

/// Receive buffer for handshake responses
const HANDSHAKE_BUF_LEN: usize = 1500;

/// Longest wait a deadline is clamped to
const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Deadline `wait` from now, clamped so huge timeouts never overflow
pub(crate) fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait.min(MAX_WAIT))
        .or_else(|| now.checked_add(Duration::from_secs(60 * 60 * 24)))
        .unwrap_or(now)
}

/// Progress of the handshake with the current candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No exchange in progress
    Idle,
    /// Discovery sent, waiting for an advertisement
    DiscoverySent,
    /// Advertisement accepted, tunnel socket connected to the relay
    AdvertisementReceived,
    /// Request sent, waiting for a membership query
    RequestSent,
    /// Membership query accepted
    QueryReceived,
}

/// What a successful handshake learned about the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Advertised relay address the tunnel is connected to
    pub relay: SocketAddr,
    /// Nonce shared by discovery, request and updates
    pub nonce: u32,
    /// MAC to echo in membership updates
    pub mac: ResponseMac,
    /// Refresh period decoded from the query's QQIC
    pub query_interval: Duration,
}

/// Drives the discovery/request exchange with one relay at a time
pub struct HandshakeEngine {
    native_timeout: Duration,
    amt_timeout: Duration,
    relay_port: u16,
    nonces: Box<dyn NonceGenerator>,
    state: HandshakeState,
}

impl HandshakeEngine {
    /// Create an engine using `config` timeouts and port
    #[must_use]
    pub fn new(config: &GatewayConfig, nonces: Box<dyn NonceGenerator>) -> Self {
        Self {
            native_timeout: config.native_timeout,
            amt_timeout: config.amt_timeout,
            relay_port: config.relay_port,
            nonces,
            state: HandshakeState::Idle,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake with `candidate` over `socket`.
    ///
    /// On success the socket is connected to the advertised relay. On any
    /// failure the engine is back in [`HandshakeState::Idle`].
    ///
    /// # Errors
    /// Per-candidate failures (`HandshakeTimeout`, `HandshakeProtocol`,
    /// `RelayUnreachable`) and fatal socket errors
    pub async fn run(
        &mut self,
        socket: &TunnelSocket,
        candidate: Ipv4Addr,
    ) -> Result<HandshakeOutcome, GatewayError> {
        let result = self.drive(socket, candidate).await;
        if result.is_err() {
            self.state = HandshakeState::Idle;
        }
        result
    }

    async fn drive(
        &mut self,
        socket: &TunnelSocket,
        candidate: Ipv4Addr,
    ) -> Result<HandshakeOutcome, GatewayError> {
        self.state = HandshakeState::Idle;
        let discovery_addr = SocketAddr::from((candidate, self.relay_port));

        let nonce = self.nonces.next_nonce();
        socket
            .send_to(&RelayDiscovery { nonce }.encode(), discovery_addr)
            .await?;
        self.state = HandshakeState::DiscoverySent;
        debug!("Relay discovery sent to {discovery_addr} (nonce 0x{nonce:08X})");

        let advertisement = await_response(
            socket,
            Some(discovery_addr),
            discovery_addr,
            self.native_timeout,
            HandshakeStage::Advertisement,
            |data| RelayAdvertisement::decode_matching(data, nonce),
        )
        .await?;

        let relay = SocketAddr::from((advertisement.relay, self.relay_port));
        socket.connect(relay).await?;
        self.state = HandshakeState::AdvertisementReceived;
        debug!("Relay {discovery_addr} advertised {relay}");

        socket.send(&RelayRequest::igmpv3(nonce).encode()).await?;
        self.state = HandshakeState::RequestSent;
        debug!("Request sent to {relay}");

        let query = await_response(
            socket,
            None,
            relay,
            self.amt_timeout,
            HandshakeStage::MembershipQuery,
            |data| MembershipQuery::decode_matching(data, nonce),
        )
        .await?;
        self.state = HandshakeState::QueryReceived;

        let outcome = HandshakeOutcome {
            relay,
            nonce,
            mac: query.mac,
            query_interval: Duration::from_secs(u64::from(query.query_interval_secs())),
        };
        debug!(
            "Membership query from {relay}: mac {}, interval {:?}",
            outcome.mac, outcome.query_interval
        );
        Ok(outcome)
    }
}

impl std::fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("native_timeout", &self.native_timeout)
            .field("amt_timeout", &self.amt_timeout)
            .field("relay_port", &self.relay_port)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Map a socket error seen while talking to `relay`
pub(crate) fn relay_socket_error(err: TransportError, relay: SocketAddr) -> GatewayError {
    match err {
        TransportError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            GatewayError::RelayUnreachable { relay }
        }
        other => GatewayError::Socket(other),
    }
}

/// Wait until `wait` elapses for the first datagram from `from` (any peer
/// if `None`) and decode it.
async fn await_response<T, F>(
    socket: &TunnelSocket,
    from: Option<SocketAddr>,
    relay: SocketAddr,
    wait: Duration,
    stage: HandshakeStage,
    decode: F,
) -> Result<T, GatewayError>
where
    F: Fn(&[u8]) -> Result<T, CodecError>,
{
    let deadline = deadline_after(wait);
    let mut buf = [0u8; HANDSHAKE_BUF_LEN];

    loop {
        let (len, peer) = timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| GatewayError::HandshakeTimeout { stage, relay })?
            .map_err(|e| relay_socket_error(e, relay))?;

        if from.is_some_and(|expected| expected != peer) {
            trace!("Ignoring {len} bytes from {peer} while waiting for {stage}");
            continue;
        }

        return decode(&buf[..len])
            .map_err(|source| GatewayError::HandshakeProtocol { relay: peer, source });
    }
}

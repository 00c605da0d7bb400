//! Tunnel bring-up and teardown.
//!
//! Candidates are tried in order. Each one gets a fresh tunnel socket and
//! goes through the handshake, the group join, the start of the refresh
//! task and a confirmatory read of the first Multicast Data. A candidate
//! that fails any of these steps is torn down before the next is tried.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, HandshakeStage};
use crate::handshake::{HandshakeEngine, HandshakeOutcome, deadline_after, relay_socket_error};
use crate::refresh::{RefreshScheduler, UpdateState};
use crate::session::Block;
use crate::stats::SessionCounters;
use amt_core::{
    AMT_HEADER_LEN, CodecError, MembershipQuery, MessageType, MulticastData, ResponseMac,
    Subscription,
};
use amt_transport::{GroupMembership, TunnelSocket};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, trace, warn};

/// Receive buffer for tunneled datagrams
pub(crate) const TUNNEL_BUF_LEN: usize = 65_536;

/// What one tunneled datagram turned out to be
#[derive(Debug)]
pub(crate) enum Received<'a> {
    /// Payload of a Multicast Data message
    Data(&'a [u8]),
    /// Multicast Data cut short inside its headers; whatever followed the
    /// AMT header
    Truncated(&'a [u8]),
    /// Anything else: re-queries are handled, the rest is skipped
    Other,
}

/// An established AMT tunnel to one relay
pub struct Tunnel {
    socket: Arc<TunnelSocket>,
    membership: GroupMembership,
    scheduler: RefreshScheduler,
    outcome: HandshakeOutcome,
    counters: Arc<SessionCounters>,
    first_block: Option<Block>,
    closed: bool,
}

impl Tunnel {
    /// Bring a tunnel up through the first candidate that works.
    ///
    /// # Errors
    /// `AllCandidatesExhausted` when every candidate failed, or the first
    /// fatal error (socket errors, membership refused)
    pub(crate) async fn establish(
        config: &GatewayConfig,
        subscription: Subscription,
        candidates: &[Ipv4Addr],
        engine: &mut HandshakeEngine,
        counters: Arc<SessionCounters>,
    ) -> Result<Self, GatewayError> {
        for (idx, &candidate) in candidates.iter().enumerate() {
            counters.record_handshake();
            debug!(
                "Trying relay candidate {candidate} ({}/{})",
                idx + 1,
                candidates.len()
            );

            match Self::try_candidate(config, subscription, candidate, engine, &counters).await {
                Ok(tunnel) => {
                    info!(
                        "Tunnel for {subscription} established via {}",
                        tunnel.relay()
                    );
                    return Ok(tunnel);
                }
                Err(e) if !e.is_fatal() => warn!("Relay candidate {candidate} failed: {e}"),
                Err(e) => return Err(e),
            }
        }

        Err(GatewayError::AllCandidatesExhausted {
            attempted: candidates.len(),
        })
    }

    async fn try_candidate(
        config: &GatewayConfig,
        subscription: Subscription,
        candidate: Ipv4Addr,
        engine: &mut HandshakeEngine,
        counters: &Arc<SessionCounters>,
    ) -> Result<Self, GatewayError> {
        let socket = Arc::new(TunnelSocket::bind(&config.socket_config())?);
        let outcome = engine.run(&socket, candidate).await?;

        let mut membership = GroupMembership::new(subscription, config.interface);
        membership.join(socket.as_udp())?;

        let mut scheduler = RefreshScheduler::new(
            Arc::clone(&socket),
            subscription,
            UpdateState {
                mac: outcome.mac,
                nonce: outcome.nonce,
                interval: outcome.query_interval,
            },
            Arc::clone(counters),
        );
        scheduler.start();

        let mut tunnel = Self {
            socket,
            membership,
            scheduler,
            outcome,
            counters: Arc::clone(counters),
            first_block: None,
            closed: false,
        };

        match tunnel.confirm(config.amt_timeout).await {
            Ok(()) => Ok(tunnel),
            Err(e) => {
                tunnel.close().await;
                Err(e)
            }
        }
    }

    /// Wait for the first Multicast Data and keep it
    async fn confirm(&mut self, wait: Duration) -> Result<(), GatewayError> {
        let deadline = deadline_after(wait);
        let mut buf = vec![0u8; TUNNEL_BUF_LEN];

        loop {
            let len = self.recv_until(&mut buf, deadline).await.map_err(|e| match e {
                GatewayError::TunnelTimeout(_) => GatewayError::HandshakeTimeout {
                    stage: HandshakeStage::MulticastData,
                    relay: self.outcome.relay,
                },
                other => other,
            })?;

            let (payload, corrupted) = match self.classify(&buf[..len]).await {
                Received::Data(payload) => (payload, false),
                Received::Truncated(payload) => (payload, true),
                Received::Other => continue,
            };
            debug!(
                "First multicast data from {} ({} bytes)",
                self.outcome.relay,
                payload.len()
            );
            self.first_block = Some(Block {
                data: payload.to_vec(),
                corrupted,
            });
            return Ok(());
        }
    }

    /// Receive one datagram before `deadline`.
    ///
    /// # Errors
    /// `TunnelTimeout` when the deadline passes, `RelayUnreachable` or a
    /// socket error when the receive fails
    pub(crate) async fn recv_until(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<usize, GatewayError> {
        let relay = self.outcome.relay;
        let started = deadline.saturating_duration_since(Instant::now());
        timeout_at(deadline, self.socket.recv(buf))
            .await
            .map_err(|_| GatewayError::TunnelTimeout(started))?
            .map_err(|e| relay_socket_error(e, relay))
    }

    /// Interpret one tunneled datagram.
    ///
    /// A Membership Query carrying the session nonce restarts the refresh
    /// task with the new MAC and interval. Multicast Data too short for its
    /// headers is handed back as `Truncated` instead of being dropped.
    pub(crate) async fn classify<'a>(&mut self, datagram: &'a [u8]) -> Received<'a> {
        match MessageType::peek(datagram) {
            Ok(MessageType::MulticastData) => match MulticastData::payload(datagram) {
                Ok(payload) => return Received::Data(payload),
                Err(CodecError::TooShort { .. }) => {
                    warn!(
                        "{} bytes multicast data from {} truncated",
                        datagram.len(),
                        self.outcome.relay
                    );
                    self.counters.record_truncated();
                    let rest = datagram.get(AMT_HEADER_LEN..).unwrap_or_default();
                    return Received::Truncated(rest);
                }
                Err(e) => warn!("Malformed multicast data from {}: {e}", self.outcome.relay),
            },
            Ok(MessageType::MembershipQuery) => {
                match MembershipQuery::decode_matching(datagram, self.outcome.nonce) {
                    Ok(query) => self.requery(&query).await,
                    Err(e) => warn!("Ignoring membership query: {e}"),
                }
            }
            Ok(other) => trace!("Skipping {other:?} from {}", self.outcome.relay),
            Err(e) => trace!("Skipping datagram from {}: {e}", self.outcome.relay),
        }
        self.counters.record_skipped();
        Received::Other
    }

    async fn requery(&mut self, query: &MembershipQuery) {
        let interval = Duration::from_secs(u64::from(query.query_interval_secs()));
        info!(
            "Relay {} re-queried: mac {}, interval {:?}",
            self.outcome.relay, query.mac, interval
        );
        self.counters.record_requery();
        self.outcome.mac = query.mac;
        self.outcome.query_interval = interval;
        self.scheduler.restart(query.mac, interval).await;
    }

    /// Block from the confirmatory Multicast Data, if not taken yet
    pub(crate) fn take_first_block(&mut self) -> Option<Block> {
        self.first_block.take()
    }

    /// Relay the tunnel is connected to
    #[must_use]
    pub fn relay(&self) -> SocketAddr {
        self.outcome.relay
    }

    /// Current response MAC
    #[must_use]
    pub fn mac(&self) -> ResponseMac {
        self.outcome.mac
    }

    /// Current refresh interval
    #[must_use]
    pub fn query_interval(&self) -> Duration {
        self.outcome.query_interval
    }

    /// Session nonce
    #[must_use]
    pub fn nonce(&self) -> u32 {
        self.outcome.nonce
    }

    /// Whether the refresh task is running
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stop refreshing, send the leave update and leave the group.
    ///
    /// Failures are logged; the socket is released when the tunnel drops.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.scheduler.stop().await;
        if let Err(e) = self.scheduler.send_leave().await {
            warn!("Leave update to {} failed: {e}", self.outcome.relay);
        }
        if let Err(e) = self.membership.leave(self.socket.as_udp()) {
            warn!("{e}");
        }
        info!("Tunnel to {} closed", self.outcome.relay);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        debug!("Tunnel to {} dropped without close", self.outcome.relay);
        self.scheduler.abort_with_leave();
        if let Err(e) = self.membership.leave(self.socket.as_udp()) {
            warn!("{e}");
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("relay", &self.outcome.relay)
            .field("mac", &self.outcome.mac)
            .field("query_interval", &self.outcome.query_interval)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

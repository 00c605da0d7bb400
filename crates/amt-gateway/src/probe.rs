//! Relay probing: handshake only, no subscription.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::handshake::{HandshakeEngine, HandshakeOutcome};
use crate::resolver::RelayResolver;
use amt_core::NonceGenerator;
use amt_transport::TunnelSocket;
use std::net::Ipv4Addr;
use tracing::debug;

/// Result of probing one relay candidate
#[derive(Debug)]
pub struct ProbeReport {
    /// Candidate the discovery was sent to
    pub candidate: Ipv4Addr,
    /// Handshake result
    pub result: Result<HandshakeOutcome, GatewayError>,
}

impl ProbeReport {
    /// Whether the candidate completed the handshake
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run the handshake against every configured relay candidate.
///
/// Each candidate gets its own socket. Nothing is joined and no update is
/// sent, so relays drop the state again after their timeout.
///
/// # Errors
/// Returns the resolution error or the first fatal socket error
pub async fn probe_relays(
    config: &GatewayConfig,
    nonces: Box<dyn NonceGenerator>,
) -> Result<Vec<ProbeReport>, GatewayError> {
    config.validate()?;

    let resolver = RelayResolver::new(config.relay_port);
    let candidates = resolver.resolve_all(config.relays()).await?;
    let mut engine = HandshakeEngine::new(config, nonces);

    let mut reports = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let socket = TunnelSocket::bind(&config.socket_config())?;
        let result = match engine.run(&socket, candidate).await {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("Probe of {candidate} failed: {e}");
                Err(e)
            }
            ok => ok,
        };
        reports.push(ProbeReport { candidate, result });
    }
    Ok(reports)
}

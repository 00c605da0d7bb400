//! Relay name resolution.
//!
//! A relay may be a literal IPv4 address or a host name. Host names are
//! resolved through the system resolver and only IPv4 results are kept, in
//! the order the resolver returned them.

use crate::error::GatewayError;
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::lookup_host;
use tracing::{debug, warn};

/// Resolves configured relays to an ordered list of candidates
#[derive(Debug, Clone, Copy)]
pub struct RelayResolver {
    port: u16,
}

impl RelayResolver {
    /// Resolver for relays listening on `port`
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Resolve one relay name or address
    ///
    /// # Errors
    /// Returns `GatewayError::ResolutionFailure` if the name yields no IPv4 address
    pub async fn resolve(&self, relay: &str) -> Result<Vec<Ipv4Addr>, GatewayError> {
        if let Ok(addr) = relay.parse::<Ipv4Addr>() {
            return Ok(vec![addr]);
        }

        let failure = |reason: String| GatewayError::ResolutionFailure {
            relay: relay.to_string(),
            reason,
        };

        let resolved = lookup_host((relay, self.port))
            .await
            .map_err(|e| failure(e.to_string()))?;

        let mut candidates = Vec::new();
        for addr in resolved {
            if let IpAddr::V4(v4) = addr.ip() {
                if !candidates.contains(&v4) {
                    candidates.push(v4);
                }
            }
        }

        if candidates.is_empty() {
            return Err(failure("no IPv4 address".to_string()));
        }

        debug!("Relay {relay} resolved to {candidates:?}");
        Ok(candidates)
    }

    /// Resolve every relay of a comma-separated list and concatenate the
    /// candidates, dropping duplicates.
    ///
    /// Names that fail to resolve are skipped as long as another succeeds.
    ///
    /// # Errors
    /// Returns `GatewayError::ResolutionFailure` if no candidate remains
    pub async fn resolve_all<'a, I>(&self, relays: I) -> Result<Vec<Ipv4Addr>, GatewayError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut candidates = Vec::new();
        let mut names = Vec::new();
        let mut last_error = None;

        for relay in relays {
            names.push(relay);
            match self.resolve(relay).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if !candidates.contains(&addr) {
                            candidates.push(addr);
                        }
                    }
                }
                Err(e) => {
                    warn!("{e}");
                    last_error = Some(e);
                }
            }
        }

        if candidates.is_empty() {
            return Err(last_error.unwrap_or_else(|| GatewayError::ResolutionFailure {
                relay: names.join(","),
                reason: "no relay configured".to_string(),
            }));
        }
        Ok(candidates)
    }
}

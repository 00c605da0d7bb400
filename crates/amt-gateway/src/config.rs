//! Gateway configuration and stream locators.

use crate::error::GatewayError;
use amt_core::{AMT_PORT, DEFAULT_MTU, Subscription};
use amt_transport::SocketConfig;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Relay used when none is configured (public anycast relay)
pub const DEFAULT_RELAY: &str = "amt-relay.m2icast.net";

/// UDP port of a stream when the locator names none
pub const DEFAULT_STREAM_PORT: u16 = 1234;

/// Largest UDP payload that fits an IPv4 datagram
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Runtime configuration of a gateway session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long the native path may stay silent before tunneling,
    /// also the wait for a Relay Advertisement
    pub native_timeout: Duration,
    /// Wait for relay responses and tunneled data
    pub amt_timeout: Duration,
    /// Relay host name or address; several may be given separated by commas
    pub relay: String,
    /// Relay UDP port
    pub relay_port: u16,
    /// Expected payload size; grows when truncation is observed
    pub mtu: usize,
    /// Local interface for group joins
    pub interface: Ipv4Addr,
    /// Socket receive buffer size
    pub recv_buffer_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            native_timeout: Duration::from_secs(3),
            amt_timeout: Duration::from_secs(5),
            relay: DEFAULT_RELAY.to_string(),
            relay_port: AMT_PORT,
            mtu: DEFAULT_MTU,
            interface: Ipv4Addr::UNSPECIFIED,
            recv_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Validate configuration
    ///
    /// # Errors
    /// Returns `GatewayError::InvalidConfig` if a value is unusable
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.native_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "native_timeout must be non-zero".to_string(),
            ));
        }
        if self.amt_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "amt_timeout must be non-zero".to_string(),
            ));
        }
        if self.relays().next().is_none() {
            return Err(GatewayError::InvalidConfig(
                "relay must name at least one host".to_string(),
            ));
        }
        if self.relay_port == 0 {
            return Err(GatewayError::InvalidConfig(
                "relay_port must be non-zero".to_string(),
            ));
        }
        if self.mtu == 0 || self.mtu > MAX_UDP_PAYLOAD {
            return Err(GatewayError::InvalidConfig(format!(
                "mtu must be within 1..={MAX_UDP_PAYLOAD}, got {}",
                self.mtu
            )));
        }
        Ok(())
    }

    /// Configured relays in order, blanks removed
    pub fn relays(&self) -> impl Iterator<Item = &str> {
        self.relay.split(',').map(str::trim).filter(|r| !r.is_empty())
    }

    /// Socket settings derived from this configuration
    #[must_use]
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            interface: self.interface,
            recv_buffer_size: self.recv_buffer_size,
            ..SocketConfig::default()
        }
    }
}

/// A multicast stream to receive: `amt://[source@]group[:port]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLocator {
    /// Group and optional source
    pub subscription: Subscription,
    /// UDP destination port of the stream
    pub port: u16,
}

impl StreamLocator {
    /// Locator for `subscription` on `port`
    #[must_use]
    pub fn new(subscription: Subscription, port: u16) -> Self {
        Self { subscription, port }
    }
}

impl FromStr for StreamLocator {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| GatewayError::InvalidLocator(format!("{s}: {why}"));

        let rest = s.trim();
        let rest = rest.strip_prefix("amt://").unwrap_or(rest);
        let rest = rest.trim_end_matches('/');

        let (source, rest) = match rest.split_once('@') {
            Some((source, rest)) => {
                let source = source
                    .parse::<Ipv4Addr>()
                    .map_err(|_| invalid("source is not an IPv4 address"))?;
                (Some(source), rest)
            }
            None => (None, rest),
        };

        let (group, port) = match rest.split_once(':') {
            Some((group, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port is not a number"))?;
                (group, port)
            }
            None => (rest, DEFAULT_STREAM_PORT),
        };

        let group = group
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("group is not an IPv4 address"))?;
        if !group.is_multicast() {
            return Err(invalid("group is not a multicast address"));
        }
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            subscription: Subscription::new(group, source),
            port,
        })
    }
}

impl fmt::Display for StreamLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amt://")?;
        if let Some(source) = self.subscription.source {
            write!(f, "{source}@")?;
        }
        write!(f, "{}:{}", self.subscription.group, self.port)
    }
}

impl From<StreamLocator> for SocketAddr {
    fn from(locator: StreamLocator) -> Self {
        SocketAddr::from((locator.subscription.group, locator.port))
    }
}

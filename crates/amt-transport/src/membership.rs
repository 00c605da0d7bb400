//! OS-level multicast group membership.
//!
//! ASM subscriptions use `IP_ADD_MEMBERSHIP`/`IP_DROP_MEMBERSHIP`; SSM
//! subscriptions use the source-specific variants. Leave mirrors whichever
//! call was used to join.

use crate::transport::{TransportError, TransportResult};
use amt_core::Subscription;
use socket2::SockRef;
use std::net::Ipv4Addr;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Membership of one socket in one subscription
#[derive(Debug)]
pub struct GroupMembership {
    subscription: Subscription,
    interface: Ipv4Addr,
    joined: bool,
}

impl GroupMembership {
    /// Membership for `subscription` joined on the local `interface`
    #[must_use]
    pub fn new(subscription: Subscription, interface: Ipv4Addr) -> Self {
        Self {
            subscription,
            interface,
            joined: false,
        }
    }

    /// Subscription this membership covers
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Whether the group is currently joined
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Join the group on `socket`. Joining twice is a no-op.
    ///
    /// # Errors
    /// Returns `TransportError::Membership` if the OS refuses the join
    pub fn join(&mut self, socket: &UdpSocket) -> TransportResult<()> {
        if self.joined {
            return Ok(());
        }

        let sock = SockRef::from(socket);
        let group = self.subscription.group;
        let result = match self.subscription.source {
            Some(source) => sock.join_ssm_v4(&source, &group, &self.interface),
            None => sock.join_multicast_v4(&group, &self.interface),
        };
        result.map_err(|error| TransportError::Membership {
            subscription: self.subscription,
            error,
        })?;

        self.joined = true;
        debug!(
            "Joined {} on interface {}",
            self.subscription, self.interface
        );
        Ok(())
    }

    /// Leave the group on `socket`. Only the first call after a join acts.
    ///
    /// # Errors
    /// Returns `TransportError::Membership` if the OS refuses the leave
    pub fn leave(&mut self, socket: &UdpSocket) -> TransportResult<()> {
        if !self.joined {
            return Ok(());
        }
        self.joined = false;

        let sock = SockRef::from(socket);
        let group = self.subscription.group;
        let result = match self.subscription.source {
            Some(source) => sock.leave_ssm_v4(&source, &group, &self.interface),
            None => sock.leave_multicast_v4(&group, &self.interface),
        };

        match result {
            Ok(()) => {
                debug!("Left {}", self.subscription);
                Ok(())
            }
            Err(error) => {
                warn!("Leaving {} failed: {}", self.subscription, error);
                Err(TransportError::Membership {
                    subscription: self.subscription,
                    error,
                })
            }
        }
    }
}

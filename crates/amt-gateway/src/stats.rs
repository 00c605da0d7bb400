//! Per-session counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a session's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Datagrams received on the native socket
    pub native_datagrams: u64,
    /// Payload bytes received on the native socket
    pub native_bytes: u64,
    /// Multicast Data messages unwrapped from the tunnel
    pub tunnel_datagrams: u64,
    /// Payload bytes unwrapped from the tunnel
    pub tunnel_bytes: u64,
    /// Native datagrams larger than the expected MTU
    pub truncated: u64,
    /// Tunnel datagrams that were not Multicast Data
    pub skipped: u64,
    /// Membership Updates sent (joins and leaves)
    pub updates_sent: u64,
    /// Membership Queries received after the handshake
    pub requeries: u64,
    /// Relay candidates a handshake was attempted with
    pub handshake_attempts: u64,
}

impl SessionStats {
    /// Total payload bytes delivered
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.native_bytes + self.tunnel_bytes
    }

    /// Total datagrams delivered
    #[must_use]
    pub fn total_datagrams(&self) -> u64 {
        self.native_datagrams + self.tunnel_datagrams
    }
}

/// Shared counters behind [`SessionStats`]
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    native_datagrams: AtomicU64,
    native_bytes: AtomicU64,
    tunnel_datagrams: AtomicU64,
    tunnel_bytes: AtomicU64,
    truncated: AtomicU64,
    skipped: AtomicU64,
    updates_sent: AtomicU64,
    requeries: AtomicU64,
    handshake_attempts: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn record_native(&self, bytes: usize) {
        self.native_datagrams.fetch_add(1, Ordering::Relaxed);
        self.native_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_tunnel(&self, bytes: usize) {
        self.tunnel_datagrams.fetch_add(1, Ordering::Relaxed);
        self.tunnel_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requery(&self) {
        self.requeries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake(&self) {
        self.handshake_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            native_datagrams: self.native_datagrams.load(Ordering::Relaxed),
            native_bytes: self.native_bytes.load(Ordering::Relaxed),
            tunnel_datagrams: self.tunnel_datagrams.load(Ordering::Relaxed),
            tunnel_bytes: self.tunnel_bytes.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            requeries: self.requeries.load(Ordering::Relaxed),
            handshake_attempts: self.handshake_attempts.load(Ordering::Relaxed),
        }
    }
}

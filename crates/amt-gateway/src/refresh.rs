//! Periodic membership refresh.
//!
//! The relay forgets a gateway that stops reporting, so a join update is
//! sent right away and then once per query interval. The task holds the
//! shared update state while sending; teardown takes the same lock for the
//! final leave, so the two never interleave on the wire.

use crate::stats::SessionCounters;
use amt_core::{MembershipUpdate, ResponseMac, Subscription};
use amt_transport::{TransportResult, TunnelSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Values every membership update is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateState {
    /// MAC from the latest membership query
    pub mac: ResponseMac,
    /// Request nonce
    pub nonce: u32,
    /// Time between join updates
    pub interval: Duration,
}

impl UpdateState {
    fn update(&self, subscription: &Subscription, leave: bool) -> MembershipUpdate {
        MembershipUpdate {
            mac: self.mac,
            nonce: self.nonce,
            record: subscription.group_record(leave),
        }
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Background task repeating the join update
pub struct RefreshScheduler {
    socket: Arc<TunnelSocket>,
    subscription: Subscription,
    state: Arc<Mutex<UpdateState>>,
    counters: Arc<SessionCounters>,
    running: Option<Running>,
}

impl RefreshScheduler {
    pub(crate) fn new(
        socket: Arc<TunnelSocket>,
        subscription: Subscription,
        state: UpdateState,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            socket,
            subscription,
            state: Arc::new(Mutex::new(state)),
            counters,
            running: None,
        }
    }

    /// Whether the task is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Current update state
    pub async fn state(&self) -> UpdateState {
        *self.state.lock().await
    }

    /// Spawn the task. The first update goes out immediately. No-op if running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(refresh_loop(
            Arc::clone(&self.socket),
            self.subscription,
            Arc::clone(&self.state),
            Arc::clone(&self.counters),
            stop_rx,
        ));
        self.running = Some(Running { stop, handle });
    }

    /// Signal the task and wait for it to finish its current iteration
    pub async fn stop(&mut self) {
        let Some(Running { stop, handle }) = self.running.take() else {
            return;
        };
        // The task may already have exited; either way it is joined below
        let _ = stop.send(());
        if let Err(e) = handle.await {
            warn!("Refresh task ended abnormally: {e}");
        }
        debug!("Membership refresh stopped for {}", self.subscription);
    }

    /// Replace MAC and interval after a relay re-query and start over
    pub async fn restart(&mut self, mac: ResponseMac, interval: Duration) {
        self.stop().await;
        {
            let mut state = self.state.lock().await;
            state.mac = mac;
            state.interval = interval;
        }
        self.start();
    }

    /// Abort the task and send the leave update without waiting.
    ///
    /// For teardown paths that cannot await; the leave is skipped if the
    /// task was mid-send or the socket is not ready.
    pub(crate) fn abort_with_leave(&mut self) {
        if let Some(Running { handle, .. }) = self.running.take() {
            handle.abort();
        }
        let Ok(state) = self.state.try_lock() else {
            warn!("Leave update for {} skipped: update in flight", self.subscription);
            return;
        };
        let update = state.update(&self.subscription, true);
        match self.socket.try_send(&update.encode()) {
            Ok(_) => {
                self.counters.record_update();
                debug!("Leave update sent for {}", self.subscription);
            }
            Err(e) => warn!("Leave update for {} failed: {e}", self.subscription),
        }
    }

    /// Send the leave update. Call after [`stop`](Self::stop).
    ///
    /// # Errors
    /// Returns the socket error if the send fails
    pub async fn send_leave(&self) -> TransportResult<()> {
        let state = self.state.lock().await;
        let update = state.update(&self.subscription, true);
        self.socket.send(&update.encode()).await?;
        self.counters.record_update();
        debug!("Leave update sent for {}", self.subscription);
        Ok(())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(Running { handle, .. }) = self.running.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("subscription", &self.subscription)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn refresh_loop(
    socket: Arc<TunnelSocket>,
    subscription: Subscription,
    state: Arc<Mutex<UpdateState>>,
    counters: Arc<SessionCounters>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        // Stop requested, or scheduler dropped
        if !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break;
        }

        let interval = {
            let state = state.lock().await;
            let update = state.update(&subscription, false);
            match socket.send(&update.encode()).await {
                Ok(_) => {
                    counters.record_update();
                    trace!("Join update sent for {subscription}");
                }
                Err(e) => warn!("Membership update for {subscription} failed: {e}"),
            }
            state.interval
        };

        tokio::select! {
            biased;
            _ = &mut stop => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

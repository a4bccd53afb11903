use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::data::messages::OutboundMessage;
use crate::error::HubError;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::ConnectionId;

/// Liveness of one connection as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Acked within the last probe interval.
    Alive,
    /// Missed at least one probe but still inside the timeout.
    Suspect,
    /// Last ack is older than the timeout; pruned on the next sweep.
    Dead,
}

/// Last-ack bookkeeping for every live connection.
pub struct HeartbeatMonitor {
    last_ack: Mutex<HashMap<ConnectionId, Instant>>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            last_ack: Mutex::new(HashMap::new()),
            interval,
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Instant>> {
        self.last_ack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts tracking a freshly accepted connection; accept counts as an ack.
    pub fn track(&self, connection_id: ConnectionId, now: Instant) {
        self.lock().insert(connection_id, now);
    }

    /// Returns `false` for connections that are no longer tracked.
    pub fn record_ack(&self, connection_id: &ConnectionId, now: Instant) -> bool {
        match self.lock().get_mut(connection_id) {
            Some(last) => {
                *last = (*last).max(now);
                true
            }
            None => false,
        }
    }

    pub fn forget(&self, connection_id: &ConnectionId) {
        self.lock().remove(connection_id);
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    pub fn liveness(&self, connection_id: &ConnectionId, now: Instant) -> Option<Liveness> {
        let last = *self.lock().get(connection_id)?;
        let silent_for = now.saturating_duration_since(last);

        Some(if silent_for <= self.interval {
            Liveness::Alive
        } else if silent_for <= self.timeout {
            Liveness::Suspect
        } else {
            Liveness::Dead
        })
    }

    pub fn is_alive(&self, connection_id: &ConnectionId, now: Instant, timeout: Duration) -> bool {
        self.lock()
            .get(connection_id)
            .map(|last| now.saturating_duration_since(*last) <= timeout)
            .unwrap_or(false)
    }

    /// Connections whose last ack predates `now - timeout`.
    pub fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        self.lock()
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > self.timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Sweep-then-probe loop. Dead connections are closed through the registry,
/// then every remaining connection gets a ping.
pub async fn run(registry: Arc<ConnectionRegistry>, cancel: CancellationToken) {
    let monitor = registry.heartbeat();
    let mut ticker = interval(monitor.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Heartbeat monitor started (interval {:?}, timeout {:?})",
        monitor.interval(),
        monitor.timeout()
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for connection_id in monitor.sweep(now) {
            // An ack may have landed since the sweep
            if monitor.is_alive(&connection_id, Instant::now(), monitor.timeout()) {
                continue;
            }
            let reason = HubError::HeartbeatTimeout(connection_id).to_string();
            registry.close(&connection_id, &reason);
        }

        let report = registry.probe_all(&OutboundMessage::ping());
        debug!(
            "Heartbeat probe sent to {}/{} connections",
            report.delivered, report.attempted
        );
    }

    info!("Heartbeat monitor stopped");
}

pub mod backoff;

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use backoff::{BackoffPolicy, BackoffState};

/// Lifecycle of a reconnecting external link.
///
/// `Degraded` is terminal: the retry budget is spent and the link stays down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub name: &'static str,
    pub state: LinkState,
    pub attempt: u32,
    pub next_delay_ms: Option<u64>,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

/// Observable state of one link, for the status endpoint and for tests that
/// need to await a transition.
#[derive(Clone)]
pub struct LinkMonitor {
    tx: watch::Sender<LinkSnapshot>,
}

impl LinkMonitor {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(LinkSnapshot {
            name,
            state: LinkState::Disconnected,
            attempt: 0,
            next_delay_ms: None,
            last_error: None,
            since: Utc::now(),
        });
        Self { tx }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> LinkState {
        self.tx.borrow().state
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.tx.subscribe()
    }

    pub fn set_state(&self, state: LinkState, attempt: u32) {
        self.tx.send_modify(|snap| {
            if snap.state != state {
                snap.since = Utc::now();
            }
            snap.state = state;
            snap.attempt = attempt;
            snap.next_delay_ms = None;
            if state == LinkState::Connected {
                snap.last_error = None;
            }
        });
    }

    pub fn record_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|snap| snap.last_error = Some(reason));
    }

    fn record_wait(&self, attempt: u32, delay: Duration) {
        self.tx.send_modify(|snap| {
            if snap.state != LinkState::Disconnected {
                snap.since = Utc::now();
            }
            snap.state = LinkState::Disconnected;
            snap.attempt = attempt;
            snap.next_delay_ms = Some(delay.as_millis() as u64);
        });
    }

    /// Resolves once the link reaches `state`.
    #[cfg(test)]
    pub async fn wait_for(&self, state: LinkState) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we hold it.
        let _ = rx.wait_for(|snap| snap.state == state).await;
    }
}

/// Sleeps out the next backoff delay. Returns `false` when the link should stop:
/// the budget is exhausted (the link is marked `Degraded`) or shutdown began.
pub async fn wait_before_retry(
    backoff: &mut BackoffState,
    monitor: &LinkMonitor,
    cancel: &CancellationToken,
) -> bool {
    let name = monitor.snapshot().name;

    let Some(delay) = backoff.next_delay() else {
        error!(
            "{} link giving up after {} consecutive failed attempts; entering degraded state",
            name,
            backoff.attempt()
        );
        monitor.set_state(LinkState::Degraded, backoff.attempt());
        return false;
    };

    warn!(
        "{} link reconnecting in {:?} (attempt {}/{})",
        name,
        delay,
        backoff.attempt(),
        backoff.policy().max_attempts
    );
    monitor.record_wait(backoff.attempt(), delay);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

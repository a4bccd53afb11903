use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::data::snapshot::PriceSnapshot;
use crate::error::Result;
use crate::link::{self, BackoffPolicy, BackoffState, LinkMonitor, LinkState};
use crate::upstream::demand::{UpstreamAction, UpstreamDemand};
use crate::upstream::{UpstreamConnector, UpstreamEvent, UpstreamSession};

enum SessionEnd {
    Cancelled,
    Dropped(String),
}

/// Owner of the single brokerage stream. Translates local demand into
/// register/deregister calls and caches the latest quote per instrument.
pub struct UpstreamBridge {
    demand: Arc<UpstreamDemand>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    cache: RwLock<HashMap<String, PriceSnapshot>>,
    link: LinkMonitor,
    policy: BackoffPolicy,
}

impl UpstreamBridge {
    pub fn new(policy: BackoffPolicy) -> Self {
        let (demand, changes) = UpstreamDemand::new();
        Self {
            demand: Arc::new(demand),
            changes: Mutex::new(Some(changes)),
            cache: RwLock::new(HashMap::new()),
            link: LinkMonitor::new("upstream"),
            policy,
        }
    }

    pub fn demand(&self) -> Arc<UpstreamDemand> {
        self.demand.clone()
    }

    pub fn link(&self) -> &LinkMonitor {
        &self.link
    }

    pub fn is_degraded(&self) -> bool {
        self.link.state() == LinkState::Degraded
    }

    #[cfg(test)]
    pub fn ensure_subscribed(&self, instrument_id: &str) -> bool {
        self.demand.ensure_subscribed(instrument_id)
    }

    #[cfg(test)]
    pub fn ensure_unsubscribed(&self, instrument_id: &str) -> bool {
        self.demand.ensure_unsubscribed(instrument_id)
    }

    /// Cached quote, served only while the link is connected.
    pub fn latest_price(&self, instrument_id: &str) -> Option<PriceSnapshot> {
        if self.link.state() != LinkState::Connected {
            return None;
        }
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instrument_id)
            .cloned()
    }

    fn store_quote(&self, snapshot: PriceSnapshot) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.instrument_id.clone(), snapshot);
    }

    /// Drives the link until shutdown or until the retry budget is spent.
    pub async fn run<C: UpstreamConnector>(self: Arc<Self>, connector: C, cancel: CancellationToken) {
        let Some(mut changes) = self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            error!("Upstream bridge is already running");
            return;
        };

        let mut backoff = BackoffState::new(self.policy.clone());

        loop {
            self.link.set_state(LinkState::Connecting, backoff.attempt());

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = connector.connect() => result,
            };

            match connected {
                Ok(mut session) => {
                    let connected_at = Instant::now();
                    self.link.set_state(LinkState::Connected, 0);
                    info!("Upstream link connected");

                    // Anything queued while down is covered by the full resubscribe
                    while changes.try_recv().is_ok() {}

                    let end = match self.resubscribe_all(session.as_mut()).await {
                        Ok(count) => {
                            if count > 0 {
                                info!("Re-registered {} instruments upstream", count);
                            }
                            self.pump(session.as_mut(), &mut changes, &cancel).await
                        }
                        Err(e) => SessionEnd::Dropped(e.to_string()),
                    };

                    self.demand.mark_all_unregistered();
                    if !backoff.session_ended(connected_at.elapsed()) {
                        debug!("Upstream session too short to reset backoff");
                    }
                    self.link.set_state(LinkState::Disconnected, backoff.attempt());

                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Dropped(reason) => {
                            warn!("Upstream link dropped: {}", reason);
                            self.link.record_error(reason);
                        }
                    }
                }
                Err(e) => {
                    warn!("Upstream connect failed: {}", e);
                    self.link.record_error(e.to_string());
                }
            }

            if !link::wait_before_retry(&mut backoff, &self.link, &cancel).await {
                break;
            }
        }

        if !self.is_degraded() {
            self.link.set_state(LinkState::Disconnected, backoff.attempt());
        }
        info!("Upstream bridge stopped");
    }

    async fn resubscribe_all(&self, session: &mut dyn UpstreamSession) -> Result<usize> {
        let instruments = self.demand.demanded();
        if instruments.is_empty() {
            return Ok(0);
        }

        session.register(&instruments).await?;
        for id in &instruments {
            self.demand.mark_registered(id, true);
        }
        Ok(instruments.len())
    }

    async fn pump(
        &self,
        session: &mut dyn UpstreamSession,
        changes: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                Some(instrument_id) = changes.recv() => {
                    if let Err(e) = self.reconcile(session, &instrument_id).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                event = session.next_event() => match event {
                    Some(Ok(UpstreamEvent::Quote(snapshot))) => self.store_quote(snapshot),
                    Some(Ok(UpstreamEvent::Notice(notice))) => debug!("Upstream notice: {}", notice),
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("closed by remote".to_string()),
                },
            }
        }
    }

    async fn reconcile(&self, session: &mut dyn UpstreamSession, instrument_id: &str) -> Result<()> {
        match self.demand.plan(instrument_id) {
            Some(UpstreamAction::Register) => {
                session.register(&[instrument_id.to_string()]).await?;
                self.demand.mark_registered(instrument_id, true);
                info!("Registered {} upstream", instrument_id);
            }
            Some(UpstreamAction::Deregister) => {
                session.deregister(&[instrument_id.to_string()]).await?;
                self.demand.mark_registered(instrument_id, false);
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(instrument_id);
                info!("Deregistered {} upstream", instrument_id);
            }
            None => {}
        }

        // A change that raced the call above is queued again by the demand
        // table, so one pass per notification is enough.
        Ok(())
    }
}

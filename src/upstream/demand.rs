use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::data::subscriptions::SubscriptionListener;
use crate::data::topic::Topic;

/// Upstream registration bookkeeping for one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpstreamSubscriptionState {
    pub ref_count: usize,
    pub registered: bool,
}

/// What the bridge must send upstream to bring an instrument in line with its
/// local demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAction {
    Register,
    Deregister,
}

/// Reference-counted local demand per instrument. Only 0 <-> 1 transitions are
/// forwarded to the bridge I/O task, which then reconciles that instrument.
pub struct UpstreamDemand {
    entries: Mutex<HashMap<String, UpstreamSubscriptionState>>,
    changes: mpsc::UnboundedSender<String>,
}

impl UpstreamDemand {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let demand = Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        };
        (demand, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UpstreamSubscriptionState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, instrument_id: &str) {
        // The receiver is owned by the bridge, which outlives every caller.
        let _ = self.changes.send(instrument_id.to_string());
    }

    /// Adds one local subscriber. Returns `true` on the 0 -> 1 transition.
    pub fn ensure_subscribed(&self, instrument_id: &str) -> bool {
        let first = {
            let mut entries = self.lock();
            let entry = entries.entry(instrument_id.to_string()).or_default();
            entry.ref_count += 1;
            entry.ref_count == 1
        };

        if first {
            debug!("Upstream demand opened for {}", instrument_id);
            self.notify(instrument_id);
        }
        first
    }

    /// Drops one local subscriber. Returns `true` on the 1 -> 0 transition.
    pub fn ensure_unsubscribed(&self, instrument_id: &str) -> bool {
        let last = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(instrument_id) else {
                warn!("Unsubscribe for {} with no upstream demand, ignoring", instrument_id);
                return false;
            };
            if entry.ref_count == 0 {
                warn!("Ref count for {} already zero, ignoring", instrument_id);
                return false;
            }

            entry.ref_count -= 1;
            let last = entry.ref_count == 0;
            if last && !entry.registered {
                entries.remove(instrument_id);
            }
            last
        };

        if last {
            debug!("Upstream demand closed for {}", instrument_id);
            self.notify(instrument_id);
        }
        last
    }

    #[cfg(test)]
    pub fn ref_count(&self, instrument_id: &str) -> usize {
        self.lock().get(instrument_id).map_or(0, |e| e.ref_count)
    }

    #[cfg(test)]
    pub fn state(&self, instrument_id: &str) -> Option<UpstreamSubscriptionState> {
        self.lock().get(instrument_id).copied()
    }

    /// What to send upstream for `instrument_id`, if anything.
    pub fn plan(&self, instrument_id: &str) -> Option<UpstreamAction> {
        let mut entries = self.lock();
        match entries.get(instrument_id).copied() {
            Some(s) if s.ref_count > 0 && !s.registered => Some(UpstreamAction::Register),
            Some(s) if s.ref_count == 0 && s.registered => Some(UpstreamAction::Deregister),
            Some(s) if s.ref_count == 0 => {
                entries.remove(instrument_id);
                None
            }
            _ => None,
        }
    }

    /// Records the outcome of a register/deregister call.
    pub fn mark_registered(&self, instrument_id: &str, registered: bool) {
        let orphaned = {
            let mut entries = self.lock();
            match entries.get_mut(instrument_id) {
                Some(entry) => {
                    entry.registered = registered;
                    if !registered && entry.ref_count == 0 {
                        entries.remove(instrument_id);
                    }
                    false
                }
                // Demand vanished while the register call was in flight
                None if registered => {
                    entries.insert(
                        instrument_id.to_string(),
                        UpstreamSubscriptionState {
                            ref_count: 0,
                            registered: true,
                        },
                    );
                    true
                }
                None => false,
            }
        };

        if orphaned {
            self.notify(instrument_id);
        }
    }

    /// Forgets every registration after the link dropped; the upstream keeps no
    /// state across connections.
    pub fn mark_all_unregistered(&self) {
        let mut entries = self.lock();
        entries.retain(|_, entry| {
            entry.registered = false;
            entry.ref_count > 0
        });
    }

    /// Instruments with at least one local subscriber.
    pub fn demanded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.ref_count > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> BTreeMap<String, UpstreamSubscriptionState> {
        self.lock().iter().map(|(id, e)| (id.clone(), *e)).collect()
    }
}

impl SubscriptionListener for UpstreamDemand {
    fn on_subscribed(&self, topic: &Topic) {
        if let Some(id) = topic.instrument() {
            self.ensure_subscribed(id);
        }
    }

    fn on_unsubscribed(&self, topic: &Topic) {
        if let Some(id) = topic.instrument() {
            self.ensure_unsubscribed(id);
        }
    }
}

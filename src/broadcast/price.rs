use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::data::messages::OutboundMessage;
use crate::data::snapshot::{PriceSnapshot, SnapshotStore};
use crate::data::topic::Topic;
use crate::error::HubError;
use crate::hub::Hub;
use crate::link::LinkState;

/// Periodically pushes the latest price of every subscribed instrument.
pub struct PriceBroadcaster {
    hub: Arc<Hub>,
    store: Arc<dyn SnapshotStore>,
    interval: Duration,
    lookup_timeout: Duration,
}

impl PriceBroadcaster {
    pub fn new(hub: Arc<Hub>, store: Arc<dyn SnapshotStore>, interval: Duration, lookup_timeout: Duration) -> Self {
        Self {
            hub,
            store,
            interval,
            lookup_timeout,
        }
    }

    /// Bridge cache first, then the store. The store lookup is bounded; a
    /// lookup that times out is skipped for this cycle.
    pub async fn lookup(&self, instrument_id: &str) -> Option<PriceSnapshot> {
        if let Some(snapshot) = self.hub.bridge().latest_price(instrument_id) {
            return Some(snapshot);
        }

        match timeout(self.lookup_timeout, self.store.snapshot(instrument_id)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!("Snapshot lookup for {} failed: {}", instrument_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "Snapshot lookup for {} timed out after {:?}, skipping this cycle",
                    instrument_id, self.lookup_timeout
                );
                None
            }
        }
    }

    /// One broadcast cycle. Returns the number of instruments published.
    pub async fn tick(&self) -> usize {
        let instruments = self.hub.table().instruments();
        if instruments.is_empty() {
            return 0;
        }

        let link_state = self.hub.bridge().link().state();
        if link_state != LinkState::Connected {
            let unavailable = HubError::UpstreamUnavailable(format!("link is {:?}", link_state));
            debug!("{}; using store snapshots", unavailable);
        }

        let snapshots = join_all(instruments.iter().map(|id| self.lookup(id))).await;

        let mut published = 0;
        for (instrument_id, snapshot) in instruments.into_iter().zip(snapshots) {
            let Some(snapshot) = snapshot else {
                continue;
            };
            let report = self
                .hub
                .publish(&Topic::Price(instrument_id), OutboundMessage::price_update(&snapshot));
            if report.delivered > 0 {
                published += 1;
            }
        }
        published
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Price broadcaster started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let published = self.tick().await;
                    if published > 0 {
                        debug!("Published prices for {} instruments", published);
                    }
                }
            }
        }

        info!("Price broadcaster stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::error::Result;
    use crate::hub::HubSettings;
    use crate::link::BackoffPolicy;
    use crate::upstream::testing::MockConnector;
    use crate::upstream::UpstreamBridge;

    pub(crate) fn snapshot(id: &str, price: f64) -> PriceSnapshot {
        PriceSnapshot {
            instrument_id: id.to_string(),
            price,
            change: 0.5,
            change_pct: 0.25,
            volume: 1_000,
            as_of: Utc::now(),
        }
    }

    /// In-memory store; instruments listed in `slow` never answer in time.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub prices: HashMap<String, PriceSnapshot>,
        pub slow: Vec<String>,
    }

    #[async_trait]
    impl SnapshotStore for FakeStore {
        async fn snapshot(&self, instrument_id: &str) -> Result<Option<PriceSnapshot>> {
            if self.slow.iter().any(|id| id == instrument_id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.prices.get(instrument_id).cloned())
        }
    }

    fn hub_with(policy: BackoffPolicy) -> Arc<Hub> {
        Arc::new(Hub::new(Arc::new(UpstreamBridge::new(policy)), HubSettings::default()))
    }

    fn prices(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "price_update" {
                out.push(value);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_fallback_when_bridge_degraded() {
        let hub = hub_with(BackoffPolicy {
            max_attempts: 1,
            jitter_ms: 0,
            ..BackoffPolicy::default()
        });
        let bridge = hub.bridge().clone();
        tokio::spawn(bridge.clone().run(MockConnector::failing_forever(), CancellationToken::new()));
        bridge.link().wait_for(LinkState::Degraded).await;

        let store = FakeStore {
            prices: HashMap::from([("AAA".to_string(), snapshot("AAA", 10.0))]),
            ..Default::default()
        };
        let broadcaster = Arc::new(PriceBroadcaster::new(
            hub.clone(),
            Arc::new(store),
            Duration::from_secs(2),
            Duration::from_secs(1),
        ));

        let (id, mut rx) = hub.connect("peer").unwrap();
        hub.subscribe(&id, "price:AAA");
        assert!(bridge.latest_price("AAA").is_none());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(broadcaster.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        cancel.cancel();
        task.await.unwrap();

        let updates = prices(&mut rx);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0]["ticker"], "AAA");
        assert_eq!(updates[0]["data"]["price"], 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookup_is_skipped_not_awaited() {
        let hub = hub_with(BackoffPolicy::default());
        let store = FakeStore {
            prices: HashMap::from([
                ("AAA".to_string(), snapshot("AAA", 10.0)),
                ("BBB".to_string(), snapshot("BBB", 20.0)),
            ]),
            slow: vec!["BBB".to_string()],
        };
        let broadcaster = PriceBroadcaster::new(hub.clone(), Arc::new(store), Duration::from_secs(2), Duration::from_secs(1));

        let (id, mut rx) = hub.connect("peer").unwrap();
        hub.subscribe(&id, "price:AAA");
        hub.subscribe(&id, "price:BBB");

        let started = tokio::time::Instant::now();
        assert_eq!(broadcaster.tick().await, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        let updates = prices(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["ticker"], "AAA");
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_quote_preferred_over_store() {
        let hub = hub_with(BackoffPolicy::default());
        let bridge = hub.bridge().clone();
        let connector = MockConnector::new();
        tokio::spawn(bridge.clone().run(connector.clone(), CancellationToken::new()));
        bridge.link().wait_for(LinkState::Connected).await;

        let store = FakeStore {
            prices: HashMap::from([("AAA".to_string(), snapshot("AAA", 10.0))]),
            ..Default::default()
        };
        let broadcaster = PriceBroadcaster::new(hub.clone(), Arc::new(store), Duration::from_secs(2), Duration::from_secs(1));

        let (id, mut rx) = hub.connect("peer").unwrap();
        hub.subscribe(&id, "price:AAA");
        assert!(connector.push_quote(snapshot("AAA", 42.0)));
        while bridge.latest_price("AAA").is_none() {
            tokio::task::yield_now().await;
        }

        broadcaster.tick().await;

        let updates = prices(&mut rx);
        assert_eq!(updates.last().unwrap()["data"]["price"], 42.0);
    }

    #[tokio::test]
    async fn test_no_subscribers_no_lookups() {
        let hub = hub_with(BackoffPolicy::default());
        let broadcaster = PriceBroadcaster::new(
            hub,
            Arc::new(FakeStore::default()),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        assert_eq!(broadcaster.tick().await, 0);
    }
}

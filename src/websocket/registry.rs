use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::data::messages::OutboundMessage;
use crate::data::subscriptions::SubscriptionTable;
use crate::data::topic::Topic;
use crate::error::{HubError, Result};
use crate::websocket::heartbeat::{HeartbeatMonitor, Liveness};
use crate::websocket::ConnectionId;

/// One accepted client socket, as seen by everything except its own I/O tasks.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer_addr: String,
    pub opened_at: DateTime<Utc>,
    tx: mpsc::Sender<Message>,
}

/// Per-connection view for the connections endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub peer_addr: String,
    pub opened_at: DateTime<Utc>,
    pub liveness: Option<Liveness>,
    pub topics: usize,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

enum Delivery {
    Sent,
    Full,
    Gone,
}

/// Owns the send side of every connection. All teardown funnels through
/// [`ConnectionRegistry::close`], so the subscription table and heartbeat
/// monitor drop a connection exactly once.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    table: Arc<SubscriptionTable>,
    heartbeat: Arc<HeartbeatMonitor>,
    max_connections: usize,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(
        table: Arc<SubscriptionTable>,
        heartbeat: Arc<HeartbeatMonitor>,
        max_connections: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            table,
            heartbeat,
            max_connections,
            queue_capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn table(&self) -> &Arc<SubscriptionTable> {
        &self.table
    }

    pub fn heartbeat(&self) -> Arc<HeartbeatMonitor> {
        self.heartbeat.clone()
    }

    /// Registers a new connection and hands back the receiving end of its send
    /// queue, which the socket writer drains.
    pub fn accept(&self, peer_addr: &str) -> Result<(ConnectionId, mpsc::Receiver<Message>)> {
        let mut connections = self.write();
        if connections.len() >= self.max_connections {
            return Err(HubError::ConnectionRejected(format!(
                "connection limit of {} reached",
                self.max_connections
            )));
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        connections.insert(
            id,
            Connection {
                id,
                peer_addr: peer_addr.to_string(),
                opened_at: Utc::now(),
                tx,
            },
        );
        self.table.register(id);
        self.heartbeat.track(id, Instant::now());

        info!(
            "Connection {} accepted from {} ({} active)",
            id,
            peer_addr,
            connections.len()
        );
        Ok((id, rx))
    }

    fn deliver(&self, connection_id: &ConnectionId, frame: Message) -> Delivery {
        let connections = self.read();
        let Some(connection) = connections.get(connection_id) else {
            return Delivery::Gone;
        };
        match connection.tx.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    fn evict(&self, connection_id: &ConnectionId, outcome: Delivery) {
        match outcome {
            Delivery::Sent => {}
            Delivery::Full => {
                self.close(connection_id, "send queue full");
            }
            Delivery::Gone => {
                self.close(connection_id, "socket closed");
            }
        }
    }

    /// Best-effort send. A failed send closes the connection instead of
    /// surfacing an error.
    pub fn send(&self, connection_id: &ConnectionId, message: &OutboundMessage) -> bool {
        match self.deliver(connection_id, Message::Text(message.to_text())) {
            Delivery::Sent => true,
            outcome => {
                self.evict(connection_id, outcome);
                false
            }
        }
    }

    /// Waits until the connection's queue has room for `slots` more frames.
    /// A full queue is waited on instead of evicted, for at most the heartbeat
    /// timeout. Returns `false` once the connection is gone.
    pub async fn wait_for_room(&self, connection_id: &ConnectionId, slots: usize) -> bool {
        let Some(tx) = self.read().get(connection_id).map(|c| c.tx.clone()) else {
            return false;
        };
        let slots = slots.min(self.queue_capacity);

        // Permits are dropped at the end of the block, handing the room back
        let reserved = timeout(self.heartbeat.timeout(), async {
            let mut permits = Vec::with_capacity(slots);
            for _ in 0..slots {
                permits.push(tx.reserve().await?);
            }
            Ok::<_, mpsc::error::SendError<()>>(())
        })
        .await;

        match reserved {
            Ok(Ok(())) => self.contains(connection_id),
            Ok(Err(_)) => {
                self.close(connection_id, "socket closed");
                false
            }
            Err(_) => {
                self.close(connection_id, "send queue full");
                false
            }
        }
    }

    /// Sends `message` to every current subscriber of `topic`. Failed recipients
    /// are closed once the fan-out is complete.
    pub fn broadcast(&self, topic: &Topic, message: &OutboundMessage) -> BroadcastReport {
        let subscribers = self.table.subscribers_of(topic);
        if subscribers.is_empty() {
            return BroadcastReport::default();
        }

        let text = message.to_text();
        let mut report = BroadcastReport {
            attempted: subscribers.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();

        for connection_id in subscribers {
            match self.deliver(&connection_id, Message::Text(text.clone())) {
                Delivery::Sent => report.delivered += 1,
                outcome => failures.push((connection_id, outcome)),
            }
        }

        report.failed = failures.len();
        if report.failed > 0 {
            let failure = HubError::PartialBroadcastFailure {
                topic: topic.to_string(),
                failed: report.failed,
                attempted: report.attempted,
            };
            warn!("{}", failure);
            for (connection_id, outcome) in failures {
                self.evict(&connection_id, outcome);
            }
        }

        report
    }

    /// Sends a liveness probe to every connection. A probe that cannot be queued
    /// is treated as a missed ack; the heartbeat sweep deals with it.
    pub fn probe_all(&self, message: &OutboundMessage) -> BroadcastReport {
        let text = message.to_text();
        let connections = self.read();
        let mut report = BroadcastReport {
            attempted: connections.len(),
            ..Default::default()
        };

        for connection in connections.values() {
            match connection.tx.try_send(Message::Text(text.clone())) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!("Probe to {} not queued: {}", connection.id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn record_ack(&self, connection_id: &ConnectionId) -> bool {
        self.heartbeat.record_ack(connection_id, Instant::now())
    }

    /// Removes the connection and all of its subscriptions. Returns `false` if it
    /// was already gone. Dropping the sender lets the writer flush and close.
    pub fn close(&self, connection_id: &ConnectionId, reason: &str) -> bool {
        let Some(connection) = self.write().remove(connection_id) else {
            return false;
        };

        let topics = self.table.teardown(connection_id);
        self.heartbeat.forget(connection_id);

        info!(
            "Connection {} from {} closed: {} ({} subscriptions dropped, {} active)",
            connection.id,
            connection.peer_addr,
            reason,
            topics.len(),
            self.connection_count()
        );
        true
    }

    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<ConnectionId> = self.read().keys().copied().collect();
        ids.iter().filter(|id| self.close(id, reason)).count()
    }

    pub fn at_capacity(&self) -> bool {
        self.connection_count() >= self.max_connections
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.read().contains_key(connection_id)
    }

    /// Oldest connection first.
    pub fn summaries(&self, now: Instant) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .read()
            .values()
            .map(|connection| ConnectionSummary {
                id: connection.id,
                peer_addr: connection.peer_addr.clone(),
                opened_at: connection.opened_at,
                liveness: self.heartbeat.liveness(&connection.id, now),
                topics: self.table.topics_of(&connection.id).len(),
            })
            .collect();
        summaries.sort_by_key(|summary| summary.opened_at);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry(max_connections: usize, queue_capacity: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(
            Arc::new(SubscriptionTable::new()),
            Arc::new(HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(90))),
            max_connections,
            queue_capacity,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Message::Text(text) = frame {
                frames.push(text);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_broadcast_reaches_exactly_the_subscribers() {
        let registry = registry(10, 16);
        let topic = Topic::price("AAA").unwrap();
        let (a, mut rx_a) = registry.accept("a").unwrap();
        let (b, mut rx_b) = registry.accept("b").unwrap();
        let (_c, mut rx_c) = registry.accept("c").unwrap();
        registry.table().subscribe(a, topic.clone()).unwrap();
        registry.table().subscribe(b, topic.clone()).unwrap();

        let report = registry.broadcast(&topic, &OutboundMessage::ping());

        assert_eq!(report, BroadcastReport { attempted: 2, delivered: 2, failed: 0 });
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_failed_recipient_is_torn_down_and_others_still_receive() {
        let registry = registry(10, 16);
        let topic = Topic::MarketStatus;
        let (alive, mut rx_alive) = registry.accept("alive").unwrap();
        let (gone, rx_gone) = registry.accept("gone").unwrap();
        registry.table().subscribe(alive, topic.clone()).unwrap();
        registry.table().subscribe(gone, topic.clone()).unwrap();
        drop(rx_gone);

        let report = registry.broadcast(&topic, &OutboundMessage::ping());

        assert_eq!(report, BroadcastReport { attempted: 2, delivered: 1, failed: 1 });
        assert_eq!(drain(&mut rx_alive).len(), 1);
        assert!(!registry.contains(&gone));
        assert!(!registry.table().subscribers_of(&topic).contains(&gone));
        assert_eq!(registry.heartbeat().tracked(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let registry = registry(10, 2);
        let (id, _rx) = registry.accept("slow").unwrap();

        assert!(registry.send(&id, &OutboundMessage::ping()));
        assert!(registry.send(&id, &OutboundMessage::ping()));
        assert!(!registry.send(&id, &OutboundMessage::ping()));
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_connection_cap_rejects() {
        let registry = registry(1, 4);
        let _first = registry.accept("first").unwrap();
        let err = registry.accept("second").unwrap_err();
        assert!(matches!(err, HubError::ConnectionRejected(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_the_queue() {
        let registry = registry(10, 4);
        let (id, mut rx) = registry.accept("peer").unwrap();
        registry.table().subscribe(id, Topic::MarketStatus).unwrap();

        assert!(registry.close(&id, "test"));
        assert!(!registry.close(&id, "test"));
        assert_eq!(registry.table().stats(), (0, 0));
        assert!(rx.recv().await.is_none());
        assert!(!registry.send(&id, &OutboundMessage::ping()));
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_close() {
        let registry = registry(10, 1);
        let (id, _rx) = registry.accept("peer").unwrap();
        registry.probe_all(&OutboundMessage::ping());

        let report = registry.probe_all(&OutboundMessage::ping());

        assert_eq!(report.failed, 1);
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_fan_out_preserves_publish_order() {
        let registry = registry(10, 64);
        let topic = Topic::signal("momentum").unwrap();
        let mut receivers = Vec::new();
        for peer in ["a", "b"] {
            let (id, rx) = registry.accept(peer).unwrap();
            registry.table().subscribe(id, topic.clone()).unwrap();
            receivers.push(rx);
        }

        let sent: Vec<String> = (0..20)
            .map(|seq| {
                let message = OutboundMessage::signal_update("momentum", vec![serde_json::json!({ "seq": seq })]);
                registry.broadcast(&topic, &message);
                message.to_text()
            })
            .collect();

        for rx in receivers.iter_mut() {
            assert_eq!(drain(rx), sent);
        }
    }

    #[tokio::test]
    async fn test_wait_for_room_waits_instead_of_evicting() {
        let registry = Arc::new(registry(10, 2));
        let (id, mut rx) = registry.accept("peer").unwrap();
        assert!(registry.send(&id, &OutboundMessage::ping()));
        assert!(registry.send(&id, &OutboundMessage::ping()));

        let waiter = tokio::spawn({
            let registry = registry.clone();
            async move { registry.wait_for_room(&id, 2).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert!(waiter.await.unwrap());
        assert!(registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_room_gives_up_after_heartbeat_timeout() {
        let registry = registry(10, 1);
        let (id, _rx) = registry.accept("stuck").unwrap();
        assert!(registry.send(&id, &OutboundMessage::ping()));

        assert!(!registry.wait_for_room(&id, 1).await);
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_summaries_report_age_liveness_and_topics() {
        let registry = registry(10, 4);
        let (first, _rx_a) = registry.accept("10.0.0.1:5000").unwrap();
        let (_second, _rx_b) = registry.accept("10.0.0.2:5000").unwrap();
        registry.table().subscribe(first, Topic::MarketStatus).unwrap();

        let summaries = registry.summaries(Instant::now());

        assert_eq!(summaries.len(), 2);
        let first_summary = summaries.iter().find(|s| s.id == first).unwrap();
        assert_eq!(first_summary.peer_addr, "10.0.0.1:5000");
        assert_eq!(first_summary.topics, 1);
        assert_eq!(first_summary.liveness, Some(Liveness::Alive));
        assert!(summaries[0].opened_at <= summaries[1].opened_at);

        let later = registry.summaries(Instant::now() + Duration::from_secs(60));
        assert!(later.iter().all(|s| s.liveness == Some(Liveness::Suspect)));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = registry(10, 4);
        for peer in ["a", "b", "c"] {
            registry.accept(peer).unwrap();
        }
        assert_eq!(registry.close_all("shutdown"), 3);
        assert_eq!(registry.connection_count(), 0);
    }
}

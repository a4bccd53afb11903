use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::data::messages::{ClientMessage, ErrorCode, OutboundMessage};
use crate::data::subscriptions::SubscriptionTable;
use crate::data::topic::Topic;
use crate::error::{HubError, Result};
use crate::upstream::UpstreamBridge;
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::registry::{BroadcastReport, ConnectionRegistry};
use crate::websocket::ConnectionId;

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            queue_capacity: 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

/// Front door for everything that changes who receives what. Client requests,
/// broadcaster publishes and disconnects all go through here.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<UpstreamBridge>,
    // Last message published to each singleton topic, replayed on subscribe
    last_values: Mutex<HashMap<Topic, OutboundMessage>>,
}

impl Hub {
    pub fn new(bridge: Arc<UpstreamBridge>, settings: HubSettings) -> Self {
        let table = Arc::new(SubscriptionTable::with_listener(bridge.demand()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            settings.heartbeat_interval,
            settings.heartbeat_timeout,
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            table,
            heartbeat,
            settings.max_connections,
            settings.queue_capacity,
        ));

        Self {
            registry,
            bridge,
            last_values: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn table(&self) -> &Arc<SubscriptionTable> {
        self.registry.table()
    }

    pub fn bridge(&self) -> &Arc<UpstreamBridge> {
        &self.bridge
    }

    /// Accepts a connection and queues its `connected` greeting.
    pub fn connect(&self, peer_addr: &str) -> Result<(ConnectionId, mpsc::Receiver<Message>)> {
        let (id, rx) = self.registry.accept(peer_addr)?;
        self.registry.send(&id, &OutboundMessage::connected(id));
        Ok((id, rx))
    }

    pub fn handle_client_message(&self, connection_id: &ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { topic } => self.subscribe(connection_id, &topic),
            ClientMessage::Unsubscribe { topic } => self.unsubscribe(connection_id, &topic),
            ClientMessage::Pong => {
                self.registry.record_ack(connection_id);
            }
            ClientMessage::Ping => {
                self.registry.send(connection_id, &OutboundMessage::pong());
            }
        }
    }

    fn parse_topic(&self, connection_id: &ConnectionId, raw: &str) -> Option<Topic> {
        match Topic::parse(raw) {
            Ok(topic) => Some(topic),
            Err(e) => {
                debug!("Connection {} sent {}", connection_id, e);
                self.registry
                    .send(connection_id, &OutboundMessage::error(ErrorCode::InvalidTopic, e.to_string()));
                None
            }
        }
    }

    /// Adds the subscription, acks it, and on a new edge pushes the latest
    /// known value for the topic.
    pub fn subscribe(&self, connection_id: &ConnectionId, raw_topic: &str) {
        let Some(topic) = self.parse_topic(connection_id, raw_topic) else {
            return;
        };

        let added = match self.table().subscribe(*connection_id, topic.clone()) {
            Ok(added) => added,
            Err(HubError::UnknownConnection(_)) => {
                debug!("Subscribe from closed connection {} ignored", connection_id);
                return;
            }
            Err(e) => {
                warn!("Subscribe to {} failed for {}: {}", topic, connection_id, e);
                return;
            }
        };

        self.registry
            .send(connection_id, &OutboundMessage::Subscribed { topic: topic.clone() });

        if added {
            self.send_last_value(connection_id, &topic);
        }
    }

    /// Applies the topics named on the connect URL. Each one first waits for
    /// room in the queue, so a long list is not taken for a slow consumer.
    pub async fn subscribe_on_connect(&self, connection_id: &ConnectionId, raw_topics: &[String]) {
        for raw_topic in raw_topics {
            // Ack plus a possible snapshot
            if !self.registry.wait_for_room(connection_id, 2).await {
                return;
            }
            self.subscribe(connection_id, raw_topic);
        }
    }

    pub fn unsubscribe(&self, connection_id: &ConnectionId, raw_topic: &str) {
        let Some(topic) = self.parse_topic(connection_id, raw_topic) else {
            return;
        };
        self.table().unsubscribe(connection_id, &topic);
        self.registry
            .send(connection_id, &OutboundMessage::Unsubscribed { topic });
    }

    fn lock_last_values(&self) -> MutexGuard<'_, HashMap<Topic, OutboundMessage>> {
        self.last_values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_last_value(&self, connection_id: &ConnectionId, topic: &Topic) {
        match topic.instrument() {
            Some(instrument_id) => {
                if let Some(snapshot) = self.bridge.latest_price(instrument_id) {
                    self.registry
                        .send(connection_id, &OutboundMessage::price_update(&snapshot));
                }
            }
            None => {
                // Sent under the lock so it cannot land after a newer publish
                let last_values = self.lock_last_values();
                if let Some(message) = last_values.get(topic) {
                    self.registry.send(connection_id, message);
                }
            }
        }
    }

    /// Fans `message` out to the topic's subscribers. Singleton topics keep the
    /// message as their latest value; the cache and the fan-out change together.
    pub fn publish(&self, topic: &Topic, message: OutboundMessage) -> BroadcastReport {
        if topic.is_price() {
            return self.registry.broadcast(topic, &message);
        }

        let mut last_values = self.lock_last_values();
        let report = self.registry.broadcast(topic, &message);
        last_values.insert(topic.clone(), message);
        report
    }

    pub fn disconnect(&self, connection_id: &ConnectionId, reason: &str) -> bool {
        self.registry.close(connection_id, reason)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::link::BackoffPolicy;

    fn hub() -> Hub {
        Hub::new(Arc::new(UpstreamBridge::new(BackoffPolicy::default())), HubSettings::default())
    }

    fn hub_with_queue(queue_capacity: usize) -> Hub {
        Hub::new(
            Arc::new(UpstreamBridge::new(BackoffPolicy::default())),
            HubSettings {
                queue_capacity,
                ..HubSettings::default()
            },
        )
    }

    fn frames(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn status(open: bool) -> OutboundMessage {
        let mut status = Map::new();
        status.insert("is_open".to_string(), Value::Bool(open));
        OutboundMessage::market_status(status)
    }

    fn sequenced(seq: u64) -> OutboundMessage {
        let mut status = Map::new();
        status.insert("seq".to_string(), Value::from(seq));
        OutboundMessage::market_status(status)
    }

    fn status_sequence(rx: &mut mpsc::Receiver<Message>) -> Vec<u64> {
        frames(rx)
            .iter()
            .filter(|frame| frame["type"] == "market_status_update")
            .filter_map(|frame| frame["seq"].as_u64())
            .collect()
    }

    #[tokio::test]
    async fn test_connect_greets_with_client_id() {
        let hub = hub();
        let (id, mut rx) = hub.connect("peer").unwrap();

        let greeting = frames(&mut rx);
        assert_eq!(greeting[0]["type"], "connected");
        assert_eq!(greeting[0]["client_id"], id.to_string());
    }

    #[tokio::test]
    async fn test_subscribe_acks_and_tracks_upstream_demand() {
        let hub = hub();
        let (a, mut rx_a) = hub.connect("a").unwrap();
        let (b, _rx_b) = hub.connect("b").unwrap();
        frames(&mut rx_a);

        hub.handle_client_message(&a, ClientMessage::Subscribe { topic: "price:aaa".to_string() });
        hub.handle_client_message(&a, ClientMessage::Subscribe { topic: "price:AAA".to_string() });
        hub.handle_client_message(&b, ClientMessage::Subscribe { topic: "price:AAA".to_string() });

        let acks = frames(&mut rx_a);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], json!({"type": "subscribed", "topic": "price:AAA"}));
        assert_eq!(hub.bridge().demand().ref_count("AAA"), 2);

        hub.disconnect(&b, "test");
        assert_eq!(hub.bridge().demand().ref_count("AAA"), 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_gets_error_frame_and_connection_survives() {
        let hub = hub();
        let (id, mut rx) = hub.connect("peer").unwrap();
        frames(&mut rx);

        hub.subscribe(&id, "weather:today");

        let reply = frames(&mut rx);
        assert_eq!(reply[0]["type"], "error");
        assert_eq!(reply[0]["code"], "invalid_topic");
        assert!(hub.registry().contains(&id));
        assert!(hub.table().topics_of(&id).is_empty());
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_last_market_status() {
        let hub = hub();
        hub.publish(&Topic::MarketStatus, status(false));
        hub.publish(&Topic::MarketStatus, status(true));

        let (id, mut rx) = hub.connect("late").unwrap();
        frames(&mut rx);
        hub.subscribe(&id, "market-status");
        hub.subscribe(&id, "market-status");

        let replies = frames(&mut rx);
        let kinds: Vec<&str> = replies.iter().map(|r| r["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["subscribed", "market_status_update", "subscribed"]);
        assert_eq!(replies[1]["is_open"], true);
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_pong_acks() {
        let hub = hub();
        let (id, mut rx) = hub.connect("peer").unwrap();
        frames(&mut rx);

        hub.handle_client_message(&id, ClientMessage::Ping);
        hub.handle_client_message(&id, ClientMessage::Pong);

        let replies = frames(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "pong");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = hub();
        let (id, mut rx) = hub.connect("peer").unwrap();
        hub.subscribe(&id, "signal:momentum");
        hub.unsubscribe(&id, "signal:momentum");
        hub.unsubscribe(&id, "signal:momentum");
        frames(&mut rx);

        assert_eq!(hub.table().subscriber_count(&Topic::signal("momentum").unwrap()), 0);
        assert!(hub.registry().contains(&id));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_publishes_in_order() {
        let hub = hub();
        let mut receivers = Vec::new();
        for peer in ["a", "b", "c"] {
            let (id, rx) = hub.connect(peer).unwrap();
            hub.subscribe(&id, "market-status");
            receivers.push(rx);
        }

        for seq in 0..50 {
            let report = hub.publish(&Topic::MarketStatus, sequenced(seq));
            assert_eq!(report.delivered, 3);
        }

        let expected: Vec<u64> = (0..50).collect();
        for rx in receivers.iter_mut() {
            assert_eq!(status_sequence(rx), expected);
        }
    }

    #[tokio::test]
    async fn test_subscribing_during_publishes_never_goes_backwards() {
        let hub = hub();
        let mut subscribers: Vec<_> = (0..16)
            .map(|i| hub.connect(&format!("peer-{}", i)).unwrap())
            .collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for seq in 0..500 {
                    hub.publish(&Topic::MarketStatus, sequenced(seq));
                }
            });
            scope.spawn(|| {
                for (id, _) in &subscribers {
                    hub.subscribe(id, "market-status");
                    std::thread::yield_now();
                }
            });
        });
        hub.publish(&Topic::MarketStatus, sequenced(500));

        for (id, rx) in subscribers.iter_mut() {
            let seen = status_sequence(rx);
            assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{}: {:?}", id, seen);
            assert_eq!(seen.last(), Some(&500));
        }
    }

    #[tokio::test]
    async fn test_connect_time_topics_wait_for_a_slow_reader() {
        let hub = hub_with_queue(4);
        let (id, mut rx) = hub.connect("peer").unwrap();
        let topics: Vec<String> = (0..10).map(|i| format!("price:S{}", i)).collect();

        let reader = tokio::spawn(async move {
            let mut kinds = Vec::new();
            while kinds.len() < 11 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                match rx.recv().await {
                    Some(Message::Text(text)) => {
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        kinds.push(frame["type"].as_str().unwrap().to_string());
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            kinds
        });

        hub.subscribe_on_connect(&id, &topics).await;
        let kinds = reader.await.unwrap();

        assert_eq!(kinds[0], "connected");
        assert_eq!(kinds.iter().filter(|kind| *kind == "subscribed").count(), 10);
        assert!(hub.registry().contains(&id));
        assert_eq!(hub.table().topics_of(&id).len(), 10);
    }

    #[tokio::test]
    async fn test_connect_time_topics_stop_once_the_reader_is_gone() {
        let hub = hub_with_queue(2);
        let (id, rx) = hub.connect("peer").unwrap();
        drop(rx);

        hub.subscribe_on_connect(&id, &["price:AAA".to_string(), "price:BBB".to_string()])
            .await;

        assert!(!hub.registry().contains(&id));
        assert_eq!(hub.bridge().demand().ref_count("AAA"), 0);
    }
}

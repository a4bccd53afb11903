use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::data::topic::Topic;
use crate::error::{HubError, Result};
use crate::websocket::ConnectionId;

/// Observer for edge changes, invoked inside the table's critical section so
/// that anything it maintains moves in lock-step with the table.
///
/// Implementations must not call back into the table.
pub trait SubscriptionListener: Send + Sync {
    fn on_subscribed(&self, topic: &Topic);
    fn on_unsubscribed(&self, topic: &Topic);
}

#[derive(Default)]
struct Edges {
    // Topic -> connections subscribed to it; entries with no subscribers are removed
    by_topic: HashMap<Topic, HashSet<ConnectionId>>,
    // Connection -> its topics; an entry exists for every live connection
    by_connection: HashMap<ConnectionId, HashSet<Topic>>,
}

/// In-memory topic <-> connection index. The single source of truth for who
/// receives what.
pub struct SubscriptionTable {
    edges: Mutex<Edges>,
    listener: Option<Arc<dyn SubscriptionListener>>,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(Edges::default()),
            listener: None,
        }
    }

    pub fn with_listener(listener: Arc<dyn SubscriptionListener>) -> Self {
        Self {
            edges: Mutex::new(Edges::default()),
            listener: Some(listener),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Edges> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a connection as live; only live connections may hold edges.
    pub fn register(&self, connection_id: ConnectionId) {
        self.lock().by_connection.entry(connection_id).or_default();
    }

    #[cfg(test)]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.lock().by_connection.contains_key(connection_id)
    }

    /// Adds the edge. Returns `true` if it was new, `false` if it already existed.
    pub fn subscribe(&self, connection_id: ConnectionId, topic: Topic) -> Result<bool> {
        let mut edges = self.lock();

        let topics = edges
            .by_connection
            .get_mut(&connection_id)
            .ok_or(HubError::UnknownConnection(connection_id))?;

        if !topics.insert(topic.clone()) {
            debug!("Connection {} already subscribed to {}", connection_id, topic);
            return Ok(false);
        }

        let subscribers = edges.by_topic.entry(topic.clone()).or_default();
        if subscribers.is_empty() {
            info!("First subscriber for topic: {}", topic);
        }
        subscribers.insert(connection_id);

        if let Some(listener) = &self.listener {
            listener.on_subscribed(&topic);
        }

        debug!("Connection {} subscribed to {}", connection_id, topic);
        Ok(true)
    }

    /// Removes the edge. Returns `true` if it existed.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, topic: &Topic) -> bool {
        let mut edges = self.lock();

        let removed = edges
            .by_connection
            .get_mut(connection_id)
            .map(|topics| topics.remove(topic))
            .unwrap_or(false);

        if !removed {
            return false;
        }

        Self::remove_reverse_edge(&mut edges, connection_id, topic);

        if let Some(listener) = &self.listener {
            listener.on_unsubscribed(topic);
        }

        debug!("Connection {} unsubscribed from {}", connection_id, topic);
        true
    }

    /// Drops the connection and every edge it holds in one step. Returns the
    /// topics it was subscribed to.
    pub fn teardown(&self, connection_id: &ConnectionId) -> Vec<Topic> {
        let mut edges = self.lock();

        let Some(topics) = edges.by_connection.remove(connection_id) else {
            return Vec::new();
        };

        for topic in &topics {
            Self::remove_reverse_edge(&mut edges, connection_id, topic);
            if let Some(listener) = &self.listener {
                listener.on_unsubscribed(topic);
            }
        }

        if !topics.is_empty() {
            debug!(
                "Connection {} torn down, released {} subscriptions",
                connection_id,
                topics.len()
            );
        }
        topics.into_iter().collect()
    }

    fn remove_reverse_edge(edges: &mut Edges, connection_id: &ConnectionId, topic: &Topic) {
        let now_empty = match edges.by_topic.get_mut(topic) {
            Some(subscribers) => {
                subscribers.remove(connection_id);
                subscribers.is_empty()
            }
            None => false,
        };

        if now_empty {
            edges.by_topic.remove(topic);
            info!("Last subscriber left topic: {}", topic);
        }
    }

    pub fn subscribers_of(&self, topic: &Topic) -> HashSet<ConnectionId> {
        self.lock().by_topic.get(topic).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.lock().by_topic.get(topic).map_or(0, HashSet::len)
    }

    pub fn topics_of(&self, connection_id: &ConnectionId) -> HashSet<Topic> {
        self.lock()
            .by_connection
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Instrument ids of every `price:` topic with at least one subscriber.
    pub fn instruments(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .by_topic
            .keys()
            .filter_map(|topic| topic.instrument().map(str::to_string))
            .collect();
        ids.sort();
        ids
    }

    /// Live subscriber count for every topic with at least one subscriber.
    pub fn topic_counts(&self) -> BTreeMap<String, usize> {
        self.lock()
            .by_topic
            .iter()
            .map(|(topic, subscribers)| (topic.to_string(), subscribers.len()))
            .collect()
    }

    /// `(topics with subscribers, live connections)`.
    pub fn stats(&self) -> (usize, usize) {
        let edges = self.lock();
        (edges.by_topic.len(), edges.by_connection.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use uuid::Uuid;

    use super::*;

    fn price(id: &str) -> Topic {
        Topic::price(id).unwrap()
    }

    fn table_with(connections: usize) -> (SubscriptionTable, Vec<ConnectionId>) {
        let table = SubscriptionTable::new();
        let ids: Vec<ConnectionId> = (0..connections).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            table.register(*id);
        }
        (table, ids)
    }

    #[derive(Default)]
    struct CountingListener {
        net: AtomicI64,
    }

    impl SubscriptionListener for CountingListener {
        fn on_subscribed(&self, _topic: &Topic) {
            self.net.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unsubscribed(&self, _topic: &Topic) {
            self.net.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let (table, ids) = table_with(1);

        assert!(table.subscribe(ids[0], price("AAA")).unwrap());
        assert!(!table.subscribe(ids[0], price("AAA")).unwrap());

        assert_eq!(table.subscriber_count(&price("AAA")), 1);
        assert_eq!(table.topics_of(&ids[0]).len(), 1);
    }

    #[test]
    fn test_unsubscribe_missing_edge_is_noop() {
        let (table, ids) = table_with(1);

        assert!(!table.unsubscribe(&ids[0], &price("AAA")));
        assert!(!table.unsubscribe(&Uuid::new_v4(), &Topic::MarketStatus));

        table.subscribe(ids[0], price("AAA")).unwrap();
        assert!(table.unsubscribe(&ids[0], &price("AAA")));
        assert!(!table.unsubscribe(&ids[0], &price("AAA")));
        assert!(table.topic_counts().is_empty());
    }

    #[test]
    fn test_subscribe_requires_live_connection() {
        let table = SubscriptionTable::new();
        let ghost = Uuid::new_v4();

        assert!(matches!(
            table.subscribe(ghost, Topic::MarketStatus),
            Err(HubError::UnknownConnection(id)) if id == ghost
        ));
        assert_eq!(table.subscriber_count(&Topic::MarketStatus), 0);
    }

    #[test]
    fn test_teardown_leaves_no_dangling_edges() {
        let (table, ids) = table_with(2);
        for topic in [price("AAA"), price("BBB"), Topic::MarketStatus] {
            table.subscribe(ids[0], topic.clone()).unwrap();
        }
        table.subscribe(ids[1], price("AAA")).unwrap();

        let released = table.teardown(&ids[0]);
        assert_eq!(released.len(), 3);

        for topic in [price("AAA"), price("BBB"), Topic::MarketStatus] {
            assert!(!table.subscribers_of(&topic).contains(&ids[0]));
        }
        assert_eq!(table.subscribers_of(&price("AAA")).len(), 1);
        assert!(!table.is_registered(&ids[0]));
        assert!(table.teardown(&ids[0]).is_empty());
        assert_eq!(table.stats(), (1, 1));
    }

    #[test]
    fn test_subscribe_after_teardown_is_rejected() {
        let (table, ids) = table_with(1);
        table.teardown(&ids[0]);
        assert!(table.subscribe(ids[0], price("AAA")).is_err());
        assert!(table.topic_counts().is_empty());
    }

    #[test]
    fn test_instruments_and_counts_reflect_live_table() {
        let (table, ids) = table_with(3);
        table.subscribe(ids[0], price("BBB")).unwrap();
        table.subscribe(ids[1], price("AAA")).unwrap();
        table.subscribe(ids[2], price("AAA")).unwrap();
        table.subscribe(ids[2], Topic::signal("breakout").unwrap()).unwrap();

        assert_eq!(table.instruments(), vec!["AAA".to_string(), "BBB".to_string()]);

        let counts = table.topic_counts();
        assert_eq!(counts.get("price:AAA"), Some(&2));
        assert_eq!(counts.get("price:BBB"), Some(&1));
        assert_eq!(counts.get("signal:breakout"), Some(&1));
    }

    #[test]
    fn test_listener_sees_every_edge_change() {
        let listener = Arc::new(CountingListener::default());
        let table = SubscriptionTable::with_listener(listener.clone());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        table.register(a);
        table.register(b);

        table.subscribe(a, price("AAA")).unwrap();
        table.subscribe(a, price("AAA")).unwrap();
        table.subscribe(b, price("AAA")).unwrap();
        table.subscribe(b, Topic::MarketStatus).unwrap();
        assert_eq!(listener.net.load(Ordering::SeqCst), 3);

        table.unsubscribe(&a, &price("AAA"));
        table.teardown(&b);
        assert_eq!(listener.net.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_subscribe_and_teardown() {
        let table = Arc::new(SubscriptionTable::new());
        let ids: Vec<ConnectionId> = (0..16).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            table.register(*id);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let table = table.clone();
                let id = *id;
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let _ = table.subscribe(id, price(&format!("S{}", n % 10)));
                    }
                    table.teardown(&id);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(table.topic_counts().is_empty());
        assert_eq!(table.stats(), (0, 0));
    }
}

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::data::snapshot::PriceSnapshot;
use crate::data::topic::Topic;
use crate::websocket::ConnectionId;

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Pong,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidTopic,
    InvalidMessage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidTopic => "invalid_topic",
            ErrorCode::InvalidMessage => "invalid_message",
        }
    }
}

/// Messages pushed to clients. Built fresh for every send and serialised in
/// [`OutboundMessage::to_json`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Connected {
        client_id: ConnectionId,
        timestamp: String,
    },
    Subscribed {
        topic: Topic,
    },
    Unsubscribed {
        topic: Topic,
    },
    PriceUpdate {
        ticker: String,
        price: f64,
        change: f64,
        change_pct: f64,
        volume: u64,
        timestamp: String,
    },
    MarketStatusUpdate {
        status: Map<String, Value>,
        timestamp: String,
    },
    SignalUpdate {
        kind: String,
        signals: Vec<Value>,
        timestamp: String,
    },
    Ping {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl OutboundMessage {
    pub fn connected(client_id: ConnectionId) -> Self {
        OutboundMessage::Connected {
            client_id,
            timestamp: now(),
        }
    }

    pub fn price_update(snapshot: &PriceSnapshot) -> Self {
        OutboundMessage::PriceUpdate {
            ticker: snapshot.instrument_id.clone(),
            price: snapshot.price,
            change: snapshot.change,
            change_pct: snapshot.change_pct,
            volume: snapshot.volume,
            timestamp: snapshot.as_of.to_rfc3339(),
        }
    }

    /// The relayed payload's own `type`/`timestamp` keys are dropped so they
    /// cannot shadow the envelope.
    pub fn market_status(mut status: Map<String, Value>) -> Self {
        status.remove("type");
        status.remove("timestamp");
        OutboundMessage::MarketStatusUpdate {
            status,
            timestamp: now(),
        }
    }

    pub fn signal_update(kind: &str, signals: Vec<Value>) -> Self {
        OutboundMessage::SignalUpdate {
            kind: kind.to_string(),
            signals,
            timestamp: now(),
        }
    }

    pub fn ping() -> Self {
        OutboundMessage::Ping { timestamp: now() }
    }

    pub fn pong() -> Self {
        OutboundMessage::Pong { timestamp: now() }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Connected { .. } => "connected",
            OutboundMessage::Subscribed { .. } => "subscribed",
            OutboundMessage::Unsubscribed { .. } => "unsubscribed",
            OutboundMessage::PriceUpdate { .. } => "price_update",
            OutboundMessage::MarketStatusUpdate { .. } => "market_status_update",
            OutboundMessage::SignalUpdate { .. } => "signal_update",
            OutboundMessage::Ping { .. } => "ping",
            OutboundMessage::Pong { .. } => "pong",
            OutboundMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Value {
        let kind = self.kind();
        match self {
            OutboundMessage::Connected { client_id, timestamp } => json!({
                "type": kind,
                "client_id": client_id.to_string(),
                "timestamp": timestamp,
            }),
            OutboundMessage::Subscribed { topic } | OutboundMessage::Unsubscribed { topic } => json!({
                "type": kind,
                "topic": topic.to_string(),
            }),
            OutboundMessage::PriceUpdate {
                ticker,
                price,
                change,
                change_pct,
                volume,
                timestamp,
            } => json!({
                "type": kind,
                "ticker": ticker,
                "data": {
                    "price": price,
                    "change": change,
                    "change_pct": change_pct,
                    "volume": volume,
                },
                "timestamp": timestamp,
            }),
            OutboundMessage::MarketStatusUpdate { status, timestamp } => {
                let mut body = status.clone();
                body.insert("type".to_string(), Value::from(kind));
                body.insert("timestamp".to_string(), Value::from(timestamp.as_str()));
                Value::Object(body)
            }
            OutboundMessage::SignalUpdate {
                kind: signal_kind,
                signals,
                timestamp,
            } => json!({
                "type": kind,
                "kind": signal_kind,
                "signals": signals,
                "count": signals.len(),
                "timestamp": timestamp,
            }),
            OutboundMessage::Ping { timestamp } | OutboundMessage::Pong { timestamp } => json!({
                "type": kind,
                "timestamp": timestamp,
            }),
            OutboundMessage::Error { code, message } => json!({
                "type": kind,
                "code": code.as_str(),
                "message": message,
            }),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}

/// One trading signal as produced by the external scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub ticker: String,
    pub signal: String,
    pub score: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalPayload {
    pub fn to_wire(&self) -> Value {
        let mut wire = self.extra.clone();
        wire.insert("ticker".to_string(), Value::from(self.ticker.to_ascii_uppercase()));
        wire.insert("signal".to_string(), Value::from(self.signal.to_ascii_lowercase()));
        wire.insert("score".to_string(), json!((self.score * 100.0).round() / 100.0));
        if let Some(price) = self.price {
            wire.insert("price".to_string(), json!(price));
        }
        wire.insert("reasons".to_string(), json!(self.reasons));
        if let Some(generated_at) = &self.generated_at {
            wire.insert("generated_at".to_string(), Value::from(generated_at.as_str()));
        }
        Value::Object(wire)
    }
}

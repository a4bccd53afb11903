use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::data::snapshot::PriceSnapshot;
use crate::error::{HubError, Result};
use crate::upstream::{UpstreamConnector, UpstreamEvent, UpstreamSession};

/// Connects to the brokerage streaming endpoint over a websocket.
pub struct BrokerageConnector {
    url: String,
    api_key: Option<String>,
    connect_timeout: Duration,
}

impl BrokerageConnector {
    pub fn new(url: impl Into<String>, api_key: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            api_key,
            connect_timeout,
        }
    }
}

#[async_trait]
impl UpstreamConnector for BrokerageConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>> {
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                HubError::UpstreamUnavailable(format!("connect timed out after {:?}", self.connect_timeout))
            })??;

        info!("Connected to brokerage stream at {}", self.url);

        let mut session = BrokerageSession {
            stream: ws_stream,
            pending: VecDeque::new(),
        };
        if let Some(key) = &self.api_key {
            session.send_json(json!({ "action": "auth", "key": key })).await?;
        }

        Ok(Box::new(session))
    }
}

struct BrokerageSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    // Events decoded from a multi-quote frame, handed out one at a time
    pending: VecDeque<UpstreamEvent>,
}

impl BrokerageSession {
    async fn send_json(&mut self, frame: Value) -> Result<()> {
        self.stream.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }
}

#[async_trait]
impl UpstreamSession for BrokerageSession {
    async fn register(&mut self, instruments: &[String]) -> Result<()> {
        debug!("Upstream subscribe {:?}", instruments);
        self.send_json(json!({ "action": "subscribe", "symbols": instruments }))
            .await
    }

    async fn deregister(&mut self, instruments: &[String]) -> Result<()> {
        debug!("Upstream unsubscribe {:?}", instruments);
        self.send_json(json!({ "action": "unsubscribe", "symbols": instruments }))
            .await
    }

    async fn next_event(&mut self) -> Option<Result<UpstreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }

            match self.stream.next().await? {
                Ok(Message::Text(text)) => self.pending.extend(parse_upstream_frame(&text)),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("Brokerage stream closed: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuoteFrame {
    symbol: String,
    price: f64,
    #[serde(default)]
    change: f64,
    #[serde(default)]
    change_pct: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl QuoteFrame {
    fn into_snapshot(self) -> PriceSnapshot {
        PriceSnapshot {
            instrument_id: self.symbol.to_ascii_uppercase(),
            price: self.price,
            change: self.change,
            change_pct: self.change_pct,
            volume: self.volume.max(0.0) as u64,
            as_of: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// Decodes one text frame from the brokerage. Frames carry a single object or
/// an array of them; anything unrecognised is dropped.
pub fn parse_upstream_frame(text: &str) -> Vec<UpstreamEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Discarding unparsable upstream frame: {}", e);
            return Vec::new();
        }
    };

    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    items.into_iter().filter_map(parse_upstream_item).collect()
}

fn parse_upstream_item(item: Value) -> Option<UpstreamEvent> {
    let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "quote" => match serde_json::from_value::<QuoteFrame>(item) {
            Ok(quote) => Some(UpstreamEvent::Quote(quote.into_snapshot())),
            Err(e) => {
                warn!("Discarding malformed upstream quote: {}", e);
                None
            }
        },
        "error" => {
            let message = item
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified upstream error");
            warn!("Brokerage reported: {}", message);
            Some(UpstreamEvent::Notice(message.to_string()))
        }
        _ => None,
    }
}

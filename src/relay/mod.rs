pub mod broker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broadcast::SignalBroadcaster;
use crate::data::messages::{OutboundMessage, SignalPayload};
use crate::data::topic::Topic;
use crate::error::{HubError, Result};
use crate::hub::Hub;
use crate::link::{self, BackoffPolicy, BackoffState, LinkMonitor, LinkState};
use crate::websocket::BroadcastReport;

pub use broker::RedisRelaySource;

pub const MARKET_STATUS_CHANNEL: &str = "market_status";
pub const SCAN_RESULTS_CHANNEL: &str = "scan_results";
pub const KNOWN_CHANNELS: [&str; 2] = [MARKET_STATUS_CHANNEL, SCAN_RESULTS_CHANNEL];

/// One raw message as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEnvelope {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Connection to the external pub/sub broker. The returned stream ends when
/// the broker connection is lost.
#[async_trait]
pub trait RelaySource: Send + Sync {
    async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, RelayEnvelope>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    MarketStatus(Map<String, Value>),
    Signals { kind: String, signals: Vec<SignalPayload> },
}

#[derive(Debug, Deserialize)]
struct ScanBatch {
    kind: String,
    #[serde(default)]
    signals: Vec<SignalPayload>,
}

/// Maps a broker message to the event it carries.
pub fn decode(envelope: &RelayEnvelope) -> Result<RelayEvent> {
    let channel = envelope.channel.as_str();
    let value: Value = serde_json::from_slice(&envelope.payload)
        .map_err(|e| HubError::relay_decode(channel, e.to_string()))?;

    match channel {
        MARKET_STATUS_CHANNEL => match value {
            Value::Object(status) => Ok(RelayEvent::MarketStatus(status)),
            other => Err(HubError::relay_decode(
                channel,
                format!("expected a JSON object, got {}", json_kind(&other)),
            )),
        },
        SCAN_RESULTS_CHANNEL => {
            let batch: ScanBatch =
                serde_json::from_value(value).map_err(|e| HubError::relay_decode(channel, e.to_string()))?;
            Topic::signal(&batch.kind).map_err(|e| HubError::relay_decode(channel, e.to_string()))?;
            Ok(RelayEvent::Signals {
                kind: batch.kind,
                signals: batch.signals,
            })
        }
        _ => Err(HubError::relay_decode(channel, "not a relayed channel")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RelayCounters {
    pub relayed: u64,
    pub dropped: u64,
}

/// Re-publishes broker events into the local fan-out path. Runs its own link
/// and backoff, independent of the upstream bridge.
pub struct CrossProcessRelay {
    hub: Arc<Hub>,
    signals: SignalBroadcaster,
    channels: Vec<String>,
    link: LinkMonitor,
    policy: BackoffPolicy,
    relayed: AtomicU64,
    dropped: AtomicU64,
}

impl CrossProcessRelay {
    pub fn new(hub: Arc<Hub>, channels: Vec<String>, policy: BackoffPolicy) -> Self {
        Self {
            signals: SignalBroadcaster::new(hub.clone()),
            hub,
            channels,
            link: LinkMonitor::new("relay"),
            policy,
            relayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn link(&self) -> &LinkMonitor {
        &self.link
    }

    pub fn counters(&self) -> RelayCounters {
        RelayCounters {
            relayed: self.relayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Decodes and publishes one message. Malformed messages are counted and
    /// dropped.
    pub fn handle(&self, envelope: &RelayEnvelope) -> Result<BroadcastReport> {
        let event = match decode(envelope) {
            Ok(event) => event,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let report = match event {
            RelayEvent::MarketStatus(status) => self
                .hub
                .publish(&Topic::MarketStatus, OutboundMessage::market_status(status)),
            RelayEvent::Signals { kind, signals } => self.signals.publish(&kind, &signals)?,
        };
        self.relayed.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    pub async fn run<S: RelaySource>(self: Arc<Self>, source: S, cancel: CancellationToken) {
        let mut backoff = BackoffState::new(self.policy.clone());

        loop {
            self.link.set_state(LinkState::Connecting, backoff.attempt());

            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = source.subscribe(&self.channels) => result,
            };

            match subscribed {
                Ok(mut messages) => {
                    let connected_at = Instant::now();
                    self.link.set_state(LinkState::Connected, 0);
                    info!("Relay connected, listening on {:?}", self.channels);

                    let cancelled = loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break true,
                            next = messages.next() => match next {
                                Some(envelope) => {
                                    if let Err(e) = self.handle(&envelope) {
                                        warn!("Dropping relay message: {}", e);
                                    } else {
                                        debug!("Relayed message from '{}'", envelope.channel);
                                    }
                                }
                                None => break false,
                            },
                        }
                    };

                    backoff.session_ended(connected_at.elapsed());
                    self.link.set_state(LinkState::Disconnected, backoff.attempt());
                    if cancelled {
                        break;
                    }
                    warn!("Relay broker connection lost");
                    self.link.record_error("broker connection lost");
                }
                Err(e) => {
                    warn!("Relay subscribe failed: {}", e);
                    self.link.record_error(e.to_string());
                }
            }

            if !link::wait_before_retry(&mut backoff, &self.link, &cancel).await {
                break;
            }
        }

        if self.link.state() != LinkState::Degraded {
            self.link.set_state(LinkState::Disconnected, backoff.attempt());
        }
        info!("Cross-process relay stopped");
    }
}

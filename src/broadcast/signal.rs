use std::sync::Arc;

use log::info;

use crate::data::messages::{OutboundMessage, SignalPayload};
use crate::data::topic::Topic;
use crate::error::Result;
use crate::hub::Hub;
use crate::websocket::BroadcastReport;

/// Formats scanner output and fans it out on `signal:<kind>`. Stateless apart
/// from the hub handle; delivery failures are absorbed by the registry.
#[derive(Clone)]
pub struct SignalBroadcaster {
    hub: Arc<Hub>,
}

impl SignalBroadcaster {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn publish(&self, kind: &str, signals: &[SignalPayload]) -> Result<BroadcastReport> {
        let topic = Topic::signal(kind)?;
        let kind = kind.trim().to_ascii_lowercase();
        let wire = signals.iter().map(SignalPayload::to_wire).collect();

        let report = self.hub.publish(&topic, OutboundMessage::signal_update(&kind, wire));
        info!(
            "Published {} {} signals to {}/{} subscribers",
            signals.len(),
            kind,
            report.delivered,
            report.attempted
        );
        Ok(report)
    }
}

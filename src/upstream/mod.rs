pub mod bridge;
pub mod brokerage;
pub mod demand;

use async_trait::async_trait;

use crate::data::snapshot::PriceSnapshot;
use crate::error::Result;

pub use bridge::UpstreamBridge;
pub use brokerage::BrokerageConnector;
pub use demand::UpstreamSubscriptionState;

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Quote(PriceSnapshot),
    Notice(String),
}

/// Opens sessions to the brokerage stream.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>>;
}

/// One live upstream connection. Dropping it closes the link.
#[async_trait]
pub trait UpstreamSession: Send {
    async fn register(&mut self, instruments: &[String]) -> Result<()>;

    async fn deregister(&mut self, instruments: &[String]) -> Result<()>;

    /// Next inbound event; `None` once the remote side closed the link.
    /// Must be cancel-safe.
    async fn next_event(&mut self) -> Option<Result<UpstreamEvent>>;
}

pub mod price;
pub mod signal;

pub use price::PriceBroadcaster;
pub use signal::SignalBroadcaster;

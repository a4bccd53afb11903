pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod server;

pub use registry::BroadcastReport;

/// Opaque id, unique for the lifetime of one client socket.
pub type ConnectionId = uuid::Uuid;

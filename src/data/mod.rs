pub mod messages;
pub mod snapshot;
pub mod subscriptions;
pub mod topic;

pub mod app_state;
pub mod batch_loader;
pub mod comments;
pub mod community;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod profile;
pub mod publish;
pub mod relay_connection;
pub mod relay_pool;
pub mod replaceable_loader;
pub mod server;
pub mod ws_relay;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used items
pub use app_state::HttpServerState;
pub use error::Error;
pub use profile::{Profile, ProfileService, RelayList};
pub use relay_pool::{RelayPool, SubscribeOptions, Subscription, SubscriptionEvent};
pub use server::ServerState;

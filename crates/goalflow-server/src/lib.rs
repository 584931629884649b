//! Goalflow Server
//!
//! HTTP surface of the Goalflow engine: step registration, plan preview,
//! flow start/query/cancel and the webhook route async steps report back
//! on.

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use crate::config::{ServerConfig, StoreConfig};
pub use crate::error::{ServerError, ServerResult};
pub use crate::server::GoalflowServer;

use std::sync::Arc;

/// Build the server from configuration and serve until shutdown
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let server = Arc::new(GoalflowServer::new(config)?);
    server.run().await
}

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod quota;
pub mod query;
pub mod representation;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod tree;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the gateway using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}

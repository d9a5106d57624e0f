use crate::{config::AppConfig, fetcher::QueryEngine, quota::RateLimiter};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: QueryEngine,
    pub quota: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, engine: QueryEngine, quota: Arc<RateLimiter>) -> Self {
        Self {
            config,
            engine,
            quota,
        }
    }
}

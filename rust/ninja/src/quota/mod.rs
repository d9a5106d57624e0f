//! Request-rate buckets and historic range limits per pricing plan.

pub mod bucket;
pub mod history;
pub mod layer;
pub mod plan;

use crate::config::QuotaConfig;
use bucket::{Probe, TokenBucket};
use dashmap::DashMap;
use plan::PricingPlan;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

pub const REFILL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    plan: PricingPlan,
    owner: String,
    ip: String,
    path: String,
}

/// Result of a rate check for a limited plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub plan: PricingPlan,
    pub limit: u64,
    pub probe: Probe,
}

/// Token buckets keyed by plan, caller, client address and path.
#[derive(Debug)]
pub struct RateLimiter {
    quota: QuotaConfig,
    buckets: DashMap<BucketKey, Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(quota: QuotaConfig) -> Self {
        Self {
            quota,
            buckets: DashMap::new(),
        }
    }

    pub fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    /// Takes one token from the caller's bucket; `None` for unrestricted plans.
    pub fn check(&self, plan: PricingPlan, owner: &str, ip: &str, path: &str) -> Option<RateLimit> {
        self.check_at(plan, owner, ip, path, Instant::now())
    }

    pub fn check_at(
        &self,
        plan: PricingPlan,
        owner: &str,
        ip: &str,
        path: &str,
        now: Instant,
    ) -> Option<RateLimit> {
        let limits = self.quota.limits(plan)?;
        let capacity = u64::from(limits.requests_per_second);
        let key = BucketKey {
            plan,
            owner: owner.to_string(),
            ip: ip.to_string(),
            path: path.to_string(),
        };

        // clone the Arc so the shard lock is released before the bucket is locked
        let bucket = Arc::clone(
            self.buckets
                .entry(key)
                .or_insert_with(|| Arc::new(TokenBucket::starting_at(capacity, REFILL_INTERVAL, now)))
                .value(),
        );
        let probe = bucket.try_consume_at(now);
        if !probe.consumed {
            debug!(policy = plan.name(), owner, ip, path, "request quota exhausted");
        }
        Some(RateLimit {
            plan,
            limit: capacity,
            probe,
        })
    }

    /// Drops buckets unused for `idle`, returning how many were removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle(now, idle));
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

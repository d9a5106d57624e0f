use super::plan::PricingPlan;
use crate::{config::QuotaConfig, error::{Result, ServiceError}};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Whole days between the calendar dates of `from` and `to`.
pub fn range_in_days(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to.date_naive() - from.date_naive()).num_days()
}

/// Refuses ranges longer than the plan's day budget. An open end means now.
pub fn check(
    quota: &QuotaConfig,
    plan: PricingPlan,
    from: DateTime<Utc>,
    to: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(limits) = quota.limits(plan) else {
        return Ok(());
    };

    let to = to.unwrap_or_else(Utc::now);
    let days = range_in_days(from, to);
    debug!(%from, %to, days, limit = limits.history_days, policy = plan.name(), "checking history quota");

    if days > limits.history_days {
        info!(policy = plan.name(), days, limit = limits.history_days, "caller hit history range limit");
        return Err(ServiceError::HistoricRangeExceeded {
            limit: limits.history_days,
            policy: plan.name().to_string(),
            hint: quota.history_url.clone(),
        });
    }
    Ok(())
}

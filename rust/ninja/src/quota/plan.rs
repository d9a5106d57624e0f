use std::fmt;

pub const ROLE_QUOTA_ADMIN: &str = "ADMIN";
pub const ROLE_QUOTA_PREMIUM: &str = "PREMIUM";
pub const ROLE_QUOTA_ADVANCED: &str = "ADVANCED";

/// Quota tier of a caller, least privileged first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PricingPlan {
    Anonymous,
    Referer,
    AuthenticatedBasic,
    AuthenticatedAdvanced,
    AuthenticatedPremium,
    NoRestriction,
}

impl PricingPlan {
    /// Picks the most privileged plan the caller qualifies for.
    pub fn resolve(roles: &[String], subject: Option<&str>, referer: Option<&str>) -> Self {
        let has = |role: &str| roles.iter().any(|granted| granted == role);
        if has(ROLE_QUOTA_ADMIN) {
            return PricingPlan::NoRestriction;
        }
        if subject.is_some_and(|subject| !subject.is_empty()) {
            if has(ROLE_QUOTA_PREMIUM) {
                return PricingPlan::AuthenticatedPremium;
            }
            if has(ROLE_QUOTA_ADVANCED) {
                return PricingPlan::AuthenticatedAdvanced;
            }
            return PricingPlan::AuthenticatedBasic;
        }
        if referer.is_some_and(|referer| !referer.trim().is_empty()) {
            return PricingPlan::Referer;
        }
        PricingPlan::Anonymous
    }

    pub fn name(self) -> &'static str {
        match self {
            PricingPlan::Anonymous => "Anonymous",
            PricingPlan::Referer => "Referer",
            PricingPlan::AuthenticatedBasic => "Authenticated Basic",
            PricingPlan::AuthenticatedAdvanced => "Authenticated Advanced",
            PricingPlan::AuthenticatedPremium => "Authenticated Premium",
            PricingPlan::NoRestriction => "No Restriction",
        }
    }
}

impl fmt::Display for PricingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request rate (tokens per second) and historic day budget of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub requests_per_second: u32,
    pub history_days: i64,
}

impl PlanLimits {
    pub const fn new(requests_per_second: u32, history_days: i64) -> Self {
        Self {
            requests_per_second,
            history_days,
        }
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use crate::quota::plan::{PricingPlan, PlanLimits};

pub const DEFAULT_HISTORY_URL: &str =
    "https://docs.opendatahub.com/en/latest/guidelines/historicdata.html";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub statement_timeout: Duration,
    pub base_url: String,
    pub host_url: String,
    pub allowed_origins: Option<Vec<String>>,
    pub response_max_size_mb: i64,
    pub quota: QuotaConfig,
    pub acl_rules_dir: Option<PathBuf>,
}

/// Per-plan request rates and historic day budgets.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub guest: PlanLimits,
    pub referer: PlanLimits,
    pub basic: PlanLimits,
    pub advanced: PlanLimits,
    pub premium: PlanLimits,
    pub history_url: String,
}

impl QuotaConfig {
    /// `None` for plans that are never limited.
    pub fn limits(&self, plan: PricingPlan) -> Option<PlanLimits> {
        match plan {
            PricingPlan::Anonymous => Some(self.guest),
            PricingPlan::Referer => Some(self.referer),
            PricingPlan::AuthenticatedBasic => Some(self.basic),
            PricingPlan::AuthenticatedAdvanced => Some(self.advanced),
            PricingPlan::AuthenticatedPremium => Some(self.premium),
            PricingPlan::NoRestriction => None,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            guest: PlanLimits::new(default_quota_guest(), default_history_guest()),
            referer: PlanLimits::new(default_quota_referer(), default_history_referer()),
            basic: PlanLimits::new(default_quota_basic(), default_history_basic()),
            advanced: PlanLimits::new(default_quota_advanced(), default_history_advanced()),
            premium: PlanLimits::new(default_quota_premium(), default_history_premium()),
            history_url: DEFAULT_HISTORY_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    ninja_listen_addr: Option<String>,
    #[serde(default)]
    ninja_listen_host: Option<String>,
    #[serde(default)]
    ninja_listen_port: Option<u16>,
    #[serde(default)]
    ninja_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    ninja_max_pool_size: u32,
    #[serde(default)]
    ninja_pg_ssl_root_cert: Option<String>,
    #[serde(default)]
    ninja_pg_ssl_cert: Option<String>,
    #[serde(default)]
    ninja_pg_ssl_key: Option<String>,
    #[serde(default = "default_statement_timeout_secs")]
    ninja_statement_timeout_secs: u64,
    #[serde(default)]
    ninja_base_url: Option<String>,
    #[serde(default)]
    ninja_host_url: Option<String>,
    #[serde(default)]
    ninja_allowed_origins: Option<String>,
    #[serde(default = "default_response_max_size_mb")]
    ninja_response_max_size_mb: i64,
    #[serde(default = "default_quota_guest")]
    ninja_quota_guest: u32,
    #[serde(default = "default_quota_referer")]
    ninja_quota_referer: u32,
    #[serde(default = "default_quota_basic")]
    ninja_quota_basic: u32,
    #[serde(default = "default_quota_advanced")]
    ninja_quota_advanced: u32,
    #[serde(default = "default_quota_premium")]
    ninja_quota_premium: u32,
    #[serde(default = "default_history_guest")]
    ninja_quota_history_guest: i64,
    #[serde(default = "default_history_referer")]
    ninja_quota_history_referer: i64,
    #[serde(default = "default_history_basic")]
    ninja_quota_history_basic: i64,
    #[serde(default = "default_history_advanced")]
    ninja_quota_history_advanced: i64,
    #[serde(default = "default_history_premium")]
    ninja_quota_history_premium: i64,
    #[serde(default)]
    ninja_quota_history_url: Option<String>,
    #[serde(default)]
    ninja_acl_rules_dir: Option<PathBuf>,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_statement_timeout_secs() -> u64 {
    30
}

const fn default_response_max_size_mb() -> i64 {
    100
}

const fn default_quota_guest() -> u32 {
    20
}

const fn default_quota_referer() -> u32 {
    100
}

const fn default_quota_basic() -> u32 {
    200
}

const fn default_quota_advanced() -> u32 {
    500
}

const fn default_quota_premium() -> u32 {
    1000
}

const fn default_history_guest() -> i64 {
    30
}

const fn default_history_referer() -> i64 {
    90
}

const fn default_history_basic() -> i64 {
    180
}

const fn default_history_advanced() -> i64 {
    365
}

const fn default_history_premium() -> i64 {
    3650
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse NINJA_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.ninja_listen_addr,
            raw.ninja_listen_host,
            raw.ninja_listen_port,
        )?;

        let database_url = raw
            .ninja_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("NINJA_DATABASE_URL or DATABASE_URL must be set")?;

        let base_url = raw
            .ninja_base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{}", listen_addr.port()));
        let host_url = raw
            .ninja_host_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| base_url.clone());

        let quota = QuotaConfig {
            guest: PlanLimits::new(raw.ninja_quota_guest, raw.ninja_quota_history_guest),
            referer: PlanLimits::new(raw.ninja_quota_referer, raw.ninja_quota_history_referer),
            basic: PlanLimits::new(raw.ninja_quota_basic, raw.ninja_quota_history_basic),
            advanced: PlanLimits::new(
                raw.ninja_quota_advanced,
                raw.ninja_quota_history_advanced,
            ),
            premium: PlanLimits::new(raw.ninja_quota_premium, raw.ninja_quota_history_premium),
            history_url: raw
                .ninja_quota_history_url
                .unwrap_or_else(|| DEFAULT_HISTORY_URL.to_string()),
        };

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.ninja_max_pool_size.max(1),
            pg_ssl_root_cert: raw.ninja_pg_ssl_root_cert,
            pg_ssl_cert: raw.ninja_pg_ssl_cert,
            pg_ssl_key: raw.ninja_pg_ssl_key,
            statement_timeout: Duration::from_secs(raw.ninja_statement_timeout_secs.max(1)),
            base_url,
            host_url,
            allowed_origins: raw.ninja_allowed_origins.and_then(|csv| split_origins(&csv)),
            response_max_size_mb: raw.ninja_response_max_size_mb,
            quota,
            acl_rules_dir: raw.ninja_acl_rules_dir,
        })
    }

    /// Configuration with defaults for everything but the database URL.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        let listen_addr = SocketAddr::from(([127, 0, 0, 1], 8080));
        let base_url = format!("http://localhost:{}", listen_addr.port());
        Self {
            listen_addr,
            database_url: database_url.into(),
            max_pool_size: default_pool_size(),
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            statement_timeout: Duration::from_secs(default_statement_timeout_secs()),
            host_url: base_url.clone(),
            base_url,
            allowed_origins: None,
            response_max_size_mb: default_response_max_size_mb(),
            quota: QuotaConfig::default(),
            acl_rules_dir: None,
        }
    }
}

fn split_origins(csv: &str) -> Option<Vec<String>> {
    let origins: Vec<_> = csv
        .split(',')
        .filter_map(|part| {
            let entry = part.trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect();

    // A lone `*` means any origin.
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        None
    } else {
        Some(origins)
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid NINJA_LISTEN_ADDR value")?
            .next()
            .context("NINJA_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8080);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid NINJA listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

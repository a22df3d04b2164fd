//! Configuration for the provisioning core.
//!
//! Everything is read from `SLIPWAY_*` environment variables at startup
//! and immutable afterwards.

use std::time::Duration;

use anyhow::Result;

use crate::router::web::WebRouterConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the core database.
    pub database_path: String,

    /// Image registry address, e.g. `registry.local:5000`. When unset,
    /// image tags carry no registry prefix and no registry cleanup runs.
    pub registry: Option<String>,

    /// Owner segment of image tags (`<owner>/app-<name>:vN`).
    pub image_owner: String,

    /// How many app image tags to keep per application. At least 1.
    pub image_history_size: usize,

    /// Container port exposed by application images.
    pub exposed_port: String,

    /// Connect timeout for container-host API calls.
    pub host_connect_timeout: Duration,

    /// Router used for application backends.
    pub default_router: String,

    pub healing: HealingConfig,

    /// Interval of the record-vs-inspection reconciliation pass.
    pub fix_interval: Duration,

    pub router: WebRouterConfig,
}

#[derive(Debug, Clone)]
pub struct HealingConfig {
    /// Interval between healer scans.
    pub scan_interval: Duration,

    /// Consecutive counted failures before a host becomes suspected.
    pub failure_threshold: u32,

    /// Window within which failures accumulate.
    pub failure_window: Duration,

    /// Maximum healing events retained in the durable history.
    pub history_limit: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            failure_threshold: 3,
            failure_window: Duration::from_secs(300),
            history_limit: 200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/slipway/core.db".to_string(),
            registry: None,
            image_owner: "slipway".to_string(),
            image_history_size: 10,
            exposed_port: "8888/tcp".to_string(),
            host_connect_timeout: Duration::from_secs(10),
            default_router: "web".to_string(),
            healing: HealingConfig::default(),
            fix_interval: Duration::from_secs(300),
            router: WebRouterConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let image_history_size = env_parse("SLIPWAY_IMAGE_HISTORY_SIZE")
            .unwrap_or(defaults.image_history_size)
            .max(1);

        let healing = HealingConfig {
            scan_interval: env_secs("SLIPWAY_HEALING_SCAN_INTERVAL")
                .unwrap_or(defaults.healing.scan_interval),
            failure_threshold: env_parse("SLIPWAY_HEALING_FAILURE_THRESHOLD")
                .unwrap_or(defaults.healing.failure_threshold),
            failure_window: env_secs("SLIPWAY_HEALING_FAILURE_WINDOW")
                .unwrap_or(defaults.healing.failure_window),
            history_limit: env_parse("SLIPWAY_HEALING_HISTORY_LIMIT")
                .unwrap_or(defaults.healing.history_limit),
        };

        let router = WebRouterConfig {
            api_url: env_string("SLIPWAY_ROUTER_API_URL").unwrap_or_default(),
            username: env_string("SLIPWAY_ROUTER_USERNAME").unwrap_or_default(),
            password: env_string("SLIPWAY_ROUTER_PASSWORD").unwrap_or_default(),
            domain: env_string("SLIPWAY_ROUTER_DOMAIN").unwrap_or_default(),
            environment: env_string("SLIPWAY_ROUTER_ENVIRONMENT").unwrap_or_default(),
            farm_type: env_string("SLIPWAY_ROUTER_FARM_TYPE").unwrap_or_default(),
            plan: env_string("SLIPWAY_ROUTER_PLAN").unwrap_or_default(),
            project: env_string("SLIPWAY_ROUTER_PROJECT").unwrap_or_default(),
            load_balance_policy: env_string("SLIPWAY_ROUTER_LOAD_BALANCE_POLICY")
                .unwrap_or_default(),
            rule_type: env_string("SLIPWAY_ROUTER_RULE_TYPE").unwrap_or_default(),
        };

        Ok(Self {
            database_path: env_string("SLIPWAY_DATABASE_PATH")
                .unwrap_or(defaults.database_path),
            registry: env_string("SLIPWAY_REGISTRY"),
            image_owner: env_string("SLIPWAY_IMAGE_OWNER").unwrap_or(defaults.image_owner),
            image_history_size,
            exposed_port: env_string("SLIPWAY_EXPOSED_PORT").unwrap_or(defaults.exposed_port),
            host_connect_timeout: env_secs("SLIPWAY_HOST_CONNECT_TIMEOUT")
                .unwrap_or(defaults.host_connect_timeout),
            default_router: env_string("SLIPWAY_DEFAULT_ROUTER")
                .unwrap_or(defaults.default_router),
            healing,
            fix_interval: env_secs("SLIPWAY_FIX_INTERVAL").unwrap_or(defaults.fix_interval),
            router,
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.image_history_size, 10);
        assert_eq!(config.image_owner, "slipway");
        assert_eq!(config.exposed_port, "8888/tcp");
        assert_eq!(config.healing.failure_threshold, 3);
    }
}

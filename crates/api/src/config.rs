//! Environment-driven configuration.

use std::time::Duration;

use easel_shared::{TierCaps, WindowCaps};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Shared secret the payment provider signs webhook bodies with.
    pub webhook_signing_secret: String,
    pub provider_url: String,
    pub provider_api_key: String,
    /// Per-attempt timeout for the upstream portrait call.
    pub provider_timeout: Duration,
    /// Credits debited per generation. None (the default) means the tier
    /// caps are the only budget.
    pub generation_credit_cost: Option<i64>,
    pub tier_caps: TierCaps,
    pub reaper_interval: Duration,
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load from the environment. Only the connection and provider
    /// settings are required; everything else has production defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let webhook_signing_secret = std::env::var("WEBHOOK_SIGNING_SECRET")
            .map_err(|_| anyhow::anyhow!("WEBHOOK_SIGNING_SECRET must be set"))?;
        let provider_url = std::env::var("PROVIDER_URL")
            .map_err(|_| anyhow::anyhow!("PROVIDER_URL must be set"))?;
        let provider_api_key = std::env::var("PROVIDER_API_KEY")
            .map_err(|_| anyhow::anyhow!("PROVIDER_API_KEY must be set"))?;

        let defaults = TierCaps::default();
        let tier_caps = TierCaps {
            anonymous: WindowCaps {
                hourly: env_i64("RATE_LIMIT_ANONYMOUS_HOURLY", defaults.anonymous.hourly),
                daily: env_i64("RATE_LIMIT_ANONYMOUS_DAILY", defaults.anonymous.daily),
            },
            authenticated: WindowCaps {
                hourly: env_i64(
                    "RATE_LIMIT_AUTHENTICATED_HOURLY",
                    defaults.authenticated.hourly,
                ),
                daily: env_i64(
                    "RATE_LIMIT_AUTHENTICATED_DAILY",
                    defaults.authenticated.daily,
                ),
            },
            premium: WindowCaps {
                hourly: env_i64("RATE_LIMIT_PREMIUM_HOURLY", defaults.premium.hourly),
                daily: env_i64("RATE_LIMIT_PREMIUM_DAILY", defaults.premium.daily),
            },
        };

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            webhook_signing_secret,
            provider_url,
            provider_api_key,
            provider_timeout: Duration::from_secs(env_i64("PROVIDER_TIMEOUT_SECS", 60) as u64),
            generation_credit_cost: std::env::var("GENERATION_CREDIT_COST")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|cost| *cost > 0),
            tier_caps,
            reaper_interval: Duration::from_secs(env_i64("REAPER_INTERVAL_SECS", 300) as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/easel_test");
        std::env::set_var("WEBHOOK_SIGNING_SECRET", "whsec_test");
        std::env::set_var("PROVIDER_URL", "http://localhost:9000/generate");
        std::env::set_var("PROVIDER_API_KEY", "pk_test");
    }

    fn clear_optional() {
        for name in [
            "BIND_ADDRESS",
            "PROVIDER_TIMEOUT_SECS",
            "GENERATION_CREDIT_COST",
            "RATE_LIMIT_ANONYMOUS_HOURLY",
            "REAPER_INTERVAL_SECS",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply() {
        set_required();
        clear_optional();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.provider_timeout, Duration::from_secs(60));
        assert_eq!(config.generation_credit_cost, None);
        assert_eq!(config.tier_caps, TierCaps::default());
    }

    #[test]
    #[serial]
    fn overrides_apply() {
        set_required();
        clear_optional();
        std::env::set_var("PROVIDER_TIMEOUT_SECS", "30");
        std::env::set_var("GENERATION_CREDIT_COST", "1");
        std::env::set_var("RATE_LIMIT_ANONYMOUS_HOURLY", "5");

        let config = Config::from_env().unwrap();
        assert_eq!(config.provider_timeout, Duration::from_secs(30));
        assert_eq!(config.generation_credit_cost, Some(1));
        assert_eq!(config.tier_caps.anonymous.hourly, 5);

        clear_optional();
    }

    #[test]
    #[serial]
    fn missing_required_fails() {
        set_required();
        std::env::remove_var("WEBHOOK_SIGNING_SECRET");
        assert!(Config::from_env().is_err());
        std::env::set_var("WEBHOOK_SIGNING_SECRET", "whsec_test");
    }

    #[test]
    #[serial]
    fn non_positive_credit_cost_is_ignored() {
        set_required();
        clear_optional();
        std::env::set_var("GENERATION_CREDIT_COST", "0");
        let config = Config::from_env().unwrap();
        assert_eq!(config.generation_credit_cost, None);
        clear_optional();
    }
}

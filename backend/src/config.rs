//! Daemon configuration, read from the environment (and `.env` when present).

use crate::error::ConfigurationError;
use std::str::FromStr;
use std::time::Duration;

pub const MIN_REFRESH_THRESHOLD_SECS: u64 = 60;

/// What the clock does with a firing that arrives while the previous one
/// for the same trigger is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogPolicy {
    Skip,
    Queue,
}

impl FromStr for BacklogPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(BacklogPolicy::Skip),
            "queue" => Ok(BacklogPolicy::Queue),
            other => Err(format!("expected 'skip' or 'queue', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub device_api_base_url: String,
    pub auth_token_url: String,
    pub auth_client_id: String,
    pub token_refresh_threshold: Duration,
    pub token_refresh_cron: String,
    pub credential_lock_wait: Duration,
    pub device_api_timeout: Duration,
    pub refresh_token_lifetime_days: i64,
    pub misfire_grace: Duration,
    pub reassert_cron: String,
    pub resync_cron: String,
    pub backlog_policy: BacklogPolicy,
    pub transient_retry_delay: Duration,
    pub weather_override_percent: i32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigurationError::Missing(name))
        };
        let string_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let token_refresh_threshold: u64 =
            parse_or(&lookup, "TOKEN_REFRESH_THRESHOLD_SECONDS", 3600)?;
        if token_refresh_threshold < MIN_REFRESH_THRESHOLD_SECS {
            return Err(ConfigurationError::Invalid {
                name: "TOKEN_REFRESH_THRESHOLD_SECONDS",
                reason: format!(
                    "{} is below the minimum of {} seconds",
                    token_refresh_threshold, MIN_REFRESH_THRESHOLD_SECS
                ),
            });
        }

        let weather_override_percent: i32 = parse_or(&lookup, "WEATHER_OVERRIDE_PERCENT", 90)?;
        if !(5..=100).contains(&weather_override_percent) {
            return Err(ConfigurationError::Invalid {
                name: "WEATHER_OVERRIDE_PERCENT",
                reason: format!("{} is outside [5, 100]", weather_override_percent),
            });
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            device_api_base_url: string_or(
                "DEVICE_API_BASE_URL",
                "https://fleet-api.prd.na.vn.cloud.tesla.com",
            ),
            auth_token_url: string_or("AUTH_TOKEN_URL", "https://auth.tesla.com/oauth2/v3/token"),
            auth_client_id: required("AUTH_CLIENT_ID")?,
            token_refresh_threshold: Duration::from_secs(token_refresh_threshold),
            token_refresh_cron: string_or("TOKEN_REFRESH_CRON", "0 */30 * * * *"),
            credential_lock_wait: Duration::from_secs(parse_or(
                &lookup,
                "CREDENTIAL_LOCK_WAIT_SECONDS",
                30,
            )?),
            device_api_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DEVICE_API_TIMEOUT_SECONDS",
                20,
            )?),
            refresh_token_lifetime_days: parse_or(&lookup, "REFRESH_TOKEN_LIFETIME_DAYS", 90)?,
            misfire_grace: Duration::from_secs(parse_or(&lookup, "MISFIRE_GRACE_SECONDS", 3600)?),
            reassert_cron: string_or("REASSERT_CRON", "0 */15 * * * *"),
            resync_cron: string_or("RESYNC_CRON", "30 * * * * *"),
            backlog_policy: parse_or(&lookup, "BACKLOG_POLICY", BacklogPolicy::Skip)?,
            transient_retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "TRANSIENT_RETRY_DELAY_MS",
                2000,
            )?),
            weather_override_percent,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigurationError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

//! Reserve scheduler daemon
//!
//! Runs as a long-lived process against Postgres:
//! - misfire recovery: once at startup, before any job is scheduled
//! - one cron job per enabled trigger, evaluated in the trigger's timezone
//! - reassert: sites with CONTINUOUS rules on REASSERT_CRON
//! - token-refresh: proactive credential refresh on TOKEN_REFRESH_CRON
//! - resync / purge-overrides: on RESYNC_CRON
//!
//! Environment variables:
//!   DATABASE_URL   - PostgreSQL connection string (required)
//!   AUTH_CLIENT_ID - OAuth client id used for token refresh (required)
//!   see `config::AppConfig` for the optional ones

use chrono::Utc;
use std::sync::Arc;

use reserve_backend::config::AppConfig;
use reserve_backend::db;
use reserve_backend::error::ClockError;
use reserve_backend::integrations::{HttpDeviceApi, HttpTokenRefresher, NoWeatherOverride};
use reserve_backend::services::clock::ReconciliationClock;
use reserve_backend::services::credentials::{CredentialLifecycleManager, CredentialSettings};
use reserve_backend::services::executor::{ExecutorSettings, ReconciliationExecutor};
use reserve_backend::services::misfire::MisfireRecoveryService;
use reserve_backend::services::rules::RuleService;
use reserve_backend::store::PgStore;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match db::init_pool(&config.database_url) {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Database unavailable: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(PgStore::new(pool));

    let (device, refresher) = match (
        HttpDeviceApi::new(config.device_api_base_url.clone(), config.device_api_timeout),
        HttpTokenRefresher::new(
            config.auth_token_url.clone(),
            config.auth_client_id.clone(),
            config.device_api_timeout,
        ),
    ) {
        (Ok(device), Ok(refresher)) => (device, refresher),
        (Err(e), _) | (_, Err(e)) => {
            log::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let credentials = Arc::new(CredentialLifecycleManager::new(
        store.clone(),
        Arc::new(refresher),
        store.clone(),
        CredentialSettings {
            refresh_threshold: config.token_refresh_threshold,
            lock_wait: config.credential_lock_wait,
            refresh_token_lifetime: std::time::Duration::from_secs(
                config.refresh_token_lifetime_days.max(1) as u64 * 24 * 3600,
            ),
        },
    ));
    let executor = Arc::new(ReconciliationExecutor::new(
        credentials.clone(),
        Arc::new(device),
        Arc::new(NoWeatherOverride),
        store.clone(),
        store.clone(),
        ExecutorSettings {
            weather_override_percent: config.weather_override_percent,
            transient_retry_delay: config.transient_retry_delay,
            device_timeout: config.device_api_timeout,
        },
    ));

    log::info!("Starting reserve scheduler...");

    // Catch up before the clock can fire anything
    let recovery = MisfireRecoveryService::new(
        store.clone(),
        store.clone(),
        executor.clone(),
        config.misfire_grace,
    );
    if let Err(e) = recovery.recover(Utc::now()).await {
        log::error!("Misfire recovery failed: {}", e);
    }

    let clock = match ReconciliationClock::new(store.clone(), executor, config.backlog_policy).await {
        Ok(clock) => Arc::new(clock),
        Err(e) => {
            log::error!("Failed to create scheduler: {}", e);
            std::process::exit(1);
        }
    };
    let rules = Arc::new(RuleService::new(store.clone()).with_listener(clock.clone()));

    if let Err(e) = start_clock(&clock, &config, credentials, rules).await {
        log::error!("Failed to start scheduler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    log::info!("Shutting down, in-flight firings are left to finish");
    if let Err(e) = clock.shutdown().await {
        log::error!("Scheduler shutdown failed: {}", e);
    }
}

async fn start_clock(
    clock: &Arc<ReconciliationClock>,
    config: &AppConfig,
    credentials: Arc<CredentialLifecycleManager>,
    rules: Arc<RuleService>,
) -> Result<(), ClockError> {
    clock.sync().await?;

    log::info!("Scheduler running. Periodic jobs:");
    clock.schedule_reassertion(&config.reassert_cron).await?;

    clock
        .schedule_task(&config.token_refresh_cron, "token-refresh", move || {
            let credentials = credentials.clone();
            async move {
                match credentials.refresh_all().await {
                    Ok(healthy) => log::info!("Token sweep: {} users hold a valid token", healthy),
                    Err(e) => log::error!("Token sweep failed: {}", e),
                }
            }
        })
        .await?;

    clock.schedule_resync(&config.resync_cron).await?;

    clock
        .schedule_task(&config.resync_cron, "purge-overrides", move || {
            let rules = rules.clone();
            async move {
                if let Err(e) = rules.purge_expired_overrides(Utc::now()).await {
                    log::error!("Override purge failed: {}", e);
                }
            }
        })
        .await?;

    clock.start().await
}

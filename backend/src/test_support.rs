//! Fakes and fixtures shared by the unit tests.

use crate::error::{DeviceError, ForecastError, RefreshError};
use crate::integrations::{DeviceApi, TokenRefresher, WeatherOverrideEvaluator};
use crate::models::{NewCredential, ReconciliationMode, Rule, TokenGrant, WeekdaySet};
use crate::services::credentials::{CredentialLifecycleManager, CredentialSettings};
use crate::services::executor::{ExecutorSettings, ReconciliationExecutor};
use crate::store::{
    CredentialStore, MemoryAuditSink, MemoryCredentialStore, MemoryExecutionHistory,
    MemoryTriggerStore,
};
use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const USER: i32 = 42;
pub const SITE: &str = "site-1";

/// Issues `token-N` / `refresh-N` pairs, counts calls and rejects reused refresh tokens.
pub struct CountingRefresher {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub failure: Option<RefreshError>,
    pub consumed: Mutex<Vec<String>>,
}

impl CountingRefresher {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
            failure: None,
            consumed: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        {
            let mut consumed = self.consumed.lock().unwrap();
            if consumed.iter().any(|t| t == refresh_token) {
                return Err(RefreshError::Rejected("refresh token reused".to_string()));
            }
            consumed.push(refresh_token.to_string());
        }
        Ok(TokenGrant {
            access_token: format!("token-{}", n),
            refresh_token: format!("refresh-{}", n),
            expires_in: 8 * 3600,
            refresh_expires_in: None,
            token_type: "Bearer".to_string(),
            scope: Some("energy_device_data energy_cmds".to_string()),
        })
    }
}

pub fn credential(user_id: i32, token: &str, expires_in: chrono::Duration) -> NewCredential {
    let now = Utc::now();
    NewCredential {
        user_id,
        access_token: token.to_string(),
        refresh_token: format!("{}-refresh", token),
        access_expires_at: now + expires_in,
        refresh_expires_at: now + chrono::Duration::days(90),
        token_type: "Bearer".to_string(),
        scope: None,
    }
}

/// In-memory battery sites.
pub struct FakeDevice {
    reserves: Mutex<HashMap<String, i32>>,
    failures: Mutex<VecDeque<DeviceError>>,
    rejected_tokens: Mutex<Vec<String>>,
    set_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub delay: Duration,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            reserves: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            rejected_tokens: Mutex::new(Vec::new()),
            set_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
        }
    }

    pub fn with_reserve(self, site_id: &str, percent: i32) -> Self {
        self.reserves
            .lock()
            .unwrap()
            .insert(site_id.to_string(), percent);
        self
    }

    pub fn reserve(&self, site_id: &str) -> Option<i32> {
        self.reserves.lock().unwrap().get(site_id).copied()
    }

    /// Makes the next `set_reserve_percent` call fail with `err`.
    pub fn fail_next(&self, err: DeviceError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().unwrap().push(token.to_string());
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn is_rejected(&self, token: &str) -> bool {
        self.rejected_tokens.lock().unwrap().iter().any(|t| t == token)
    }
}

#[async_trait]
impl DeviceApi for FakeDevice {
    async fn set_reserve_percent(
        &self,
        site_id: &str,
        percent: i32,
        access_token: &str,
    ) -> Result<(), DeviceError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.is_rejected(access_token) {
            return Err(DeviceError::Unauthorized);
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.reserves
            .lock()
            .unwrap()
            .insert(site_id.to_string(), percent);
        Ok(())
    }

    async fn get_reserve_percent(&self, site_id: &str, access_token: &str) -> Result<i32, DeviceError> {
        if self.is_rejected(access_token) {
            return Err(DeviceError::Unauthorized);
        }
        self.reserve(site_id)
            .ok_or_else(|| DeviceError::SiteUnavailable(site_id.to_string()))
    }
}

pub struct FixedWeather(pub Result<bool, ForecastError>);

#[async_trait]
impl WeatherOverrideEvaluator for FixedWeather {
    async fn is_bad_weather(&self, _site_id: &str) -> Result<bool, ForecastError> {
        self.0.clone()
    }
}

pub fn sample_rule() -> Rule {
    Rule {
        user_id: USER,
        site_id: SITE.to_string(),
        name: "Weekday peak".to_string(),
        description: None,
        weekdays: WeekdaySet::weekdays(),
        start_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
        timezone: "America/Denver".to_string(),
        on_peak_percent: 20,
        off_peak_percent: 80,
        mode: ReconciliationMode::Continuous,
        enabled: true,
    }
}

pub struct Harness {
    pub credentials: Arc<MemoryCredentialStore>,
    pub refresher: Arc<CountingRefresher>,
    pub device: Arc<FakeDevice>,
    pub history: Arc<MemoryExecutionHistory>,
    pub audit: Arc<MemoryAuditSink>,
    pub triggers: Arc<MemoryTriggerStore>,
    pub executor: Arc<ReconciliationExecutor>,
}

/// Executor wired to in-memory stores, with a valid credential for `USER`.
pub async fn harness(device: FakeDevice, weather: Result<bool, ForecastError>) -> Harness {
    let credentials = Arc::new(MemoryCredentialStore::new());
    credentials
        .insert(credential(USER, "valid", chrono::Duration::hours(8)))
        .await
        .unwrap();
    let refresher = Arc::new(CountingRefresher::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let history = Arc::new(MemoryExecutionHistory::new());
    let device = Arc::new(device);
    let manager = Arc::new(CredentialLifecycleManager::new(
        credentials.clone(),
        refresher.clone(),
        audit.clone(),
        CredentialSettings::default(),
    ));
    let executor = Arc::new(ReconciliationExecutor::new(
        manager,
        device.clone(),
        Arc::new(FixedWeather(weather)),
        history.clone(),
        audit.clone(),
        ExecutorSettings {
            weather_override_percent: 90,
            transient_retry_delay: Duration::from_millis(10),
            device_timeout: Duration::from_secs(2),
        },
    ));
    Harness {
        credentials,
        refresher,
        device,
        history,
        audit,
        triggers: Arc::new(MemoryTriggerStore::new()),
        executor,
    }
}

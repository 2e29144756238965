use crate::error::{CredentialError, DeviceError, GuardedCallError};
use crate::integrations::{DeviceApi, WeatherOverrideEvaluator};
use crate::models::{
    AuditEvent, AuditEventKind, EventKind, ExecutionRecord, ExecutionStatus, ExecutionType,
    ReconciliationMode, Trigger,
};
use crate::services::credentials::CredentialLifecycleManager;
use crate::store::{AuditSink, ExecutionHistoryStore};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Result of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied { percent: i32 },
    Skipped { reason: String },
    Failed { error: String },
}

impl Outcome {
    fn status(&self) -> ExecutionStatus {
        match self {
            Outcome::Applied { .. } => ExecutionStatus::Success,
            Outcome::Skipped { .. } => ExecutionStatus::Skipped,
            Outcome::Failed { .. } => ExecutionStatus::Failure,
        }
    }

    fn describe(&self) -> String {
        match self {
            Outcome::Applied { percent } => format!("reserve set to {}%", percent),
            Outcome::Skipped { reason } => reason.clone(),
            Outcome::Failed { error } => error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Reserve substituted when bad weather is reported.
    pub weather_override_percent: i32,
    /// Pause before retrying a transient failure. A firing gets one retry,
    /// shared with the retry after an auth rejection.
    pub transient_retry_delay: Duration,
    /// Bound on each Device API call.
    pub device_timeout: Duration,
}

/// Applies fired Triggers to the Device API and records what happened.
pub struct ReconciliationExecutor {
    credentials: Arc<CredentialLifecycleManager>,
    device: Arc<dyn DeviceApi>,
    weather: Arc<dyn WeatherOverrideEvaluator>,
    history: Arc<dyn ExecutionHistoryStore>,
    audit: Arc<dyn AuditSink>,
    settings: ExecutorSettings,
    weather_paused_until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ReconciliationExecutor {
    pub fn new(
        credentials: Arc<CredentialLifecycleManager>,
        device: Arc<dyn DeviceApi>,
        weather: Arc<dyn WeatherOverrideEvaluator>,
        history: Arc<dyn ExecutionHistoryStore>,
        audit: Arc<dyn AuditSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            credentials,
            device,
            weather,
            history,
            audit,
            settings,
            weather_paused_until: Mutex::new(HashMap::new()),
        }
    }

    /// No weather override is applied to the site before `until`.
    pub async fn suspend_weather_override(&self, site_id: &str, until: DateTime<Utc>) {
        info!("Weather override for site {} suspended until {}", site_id, until);
        self.weather_paused_until
            .lock()
            .await
            .insert(site_id.to_string(), until);
    }

    /// Fires `trigger` once. Never returns an error: failures are recorded
    /// in the execution history and audit trail.
    pub async fn execute(
        &self,
        trigger: &Trigger,
        execution_type: ExecutionType,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Outcome {
        let now = Utc::now();
        if !trigger.enabled {
            let outcome = Outcome::Skipped {
                reason: "trigger disabled".to_string(),
            };
            return self.finish(trigger, execution_type, scheduled_for, outcome).await;
        }
        if !trigger.is_within_bounds(now) {
            let outcome = Outcome::Skipped {
                reason: "outside override validity window".to_string(),
            };
            return self.finish(trigger, execution_type, scheduled_for, outcome).await;
        }

        let percent = self.resolve_target(trigger, now, true).await;
        let outcome = match self.set_reserve(trigger, percent).await {
            Ok(()) => Outcome::Applied { percent },
            Err(e) => Outcome::Failed {
                error: failure_detail(&e),
            },
        };
        self.finish(trigger, execution_type, scheduled_for, outcome).await
    }

    /// Re-asserts a CONTINUOUS trigger's target between its boundaries.
    ///
    /// Only corrects in the direction the period calls for: during on-peak a
    /// reserve above target is lowered, during off-peak a reserve below
    /// target is raised. A manual change the other way is left alone.
    pub async fn reassert(&self, trigger: &Trigger) -> Outcome {
        let execution_type = ExecutionType::ReconciliationContinuous;
        let now = Utc::now();
        if trigger.mode != ReconciliationMode::Continuous {
            return Outcome::Skipped {
                reason: "one-shot triggers are not re-asserted".to_string(),
            };
        }
        if !trigger.enabled || !trigger.is_within_bounds(now) {
            return Outcome::Skipped {
                reason: "trigger inactive".to_string(),
            };
        }

        let expected = self.resolve_target(trigger, now, false).await;
        let actual = match self.read_reserve(trigger).await {
            Ok(actual) => actual,
            Err(e) => {
                let outcome = Outcome::Failed {
                    error: failure_detail(&e),
                };
                return self.finish(trigger, execution_type, None, outcome).await;
            }
        };

        let needs_correction = match trigger.event_kind {
            EventKind::StartDischarge => actual > expected,
            EventKind::StartCharge => actual < expected,
        };
        let outcome = if actual == expected {
            Outcome::Skipped {
                reason: format!("already at {}%", expected),
            }
        } else if !needs_correction {
            Outcome::Skipped {
                reason: format!(
                    "user override kept: reserve is {}%, schedule expects {}%",
                    actual, expected
                ),
            }
        } else {
            info!(
                "Correcting site {} reserve from {}% to {}% ({})",
                trigger.site_id, actual, expected, trigger.name
            );
            match self.set_reserve(trigger, expected).await {
                Ok(()) => Outcome::Applied { percent: expected },
                Err(e) => Outcome::Failed {
                    error: failure_detail(&e),
                },
            }
        };
        self.finish(trigger, execution_type, None, outcome).await
    }

    /// The trigger's percent, or the weather override percent when a
    /// CONTINUOUS trigger is eligible for it. Weather decisions are audited
    /// only when `audit` is set, i.e. on boundary firings.
    async fn resolve_target(&self, trigger: &Trigger, now: DateTime<Utc>, audit: bool) -> i32 {
        let base = trigger.target_percent;
        if trigger.mode != ReconciliationMode::Continuous {
            return base;
        }

        let bad_weather = match self.weather.is_bad_weather(&trigger.site_id).await {
            Ok(bad) => bad,
            Err(e) => {
                warn!(
                    "Weather evaluation for site {} failed, using scheduled {}%: {}",
                    trigger.site_id, base, e
                );
                self.weather_audit(audit, trigger, AuditEventKind::EvaluationFailure, e.to_string())
                    .await;
                return base;
            }
        };
        if !bad_weather {
            self.weather_audit(
                audit,
                trigger,
                AuditEventKind::EvaluationGoodWeather,
                "no override needed",
            )
            .await;
            return base;
        }
        self.weather_audit(
            audit,
            trigger,
            AuditEventKind::EvaluationBadWeather,
            "bad weather forecast",
        )
        .await;

        let override_percent = self.settings.weather_override_percent;
        let paused_until = self
            .weather_paused_until
            .lock()
            .await
            .get(&trigger.site_id)
            .copied()
            .filter(|until| *until > now);

        let skip_reason = if trigger.event_kind == EventKind::StartDischarge {
            Some("on-peak period".to_string())
        } else if base >= override_percent {
            Some(format!(
                "scheduled {}% already at or above override {}%",
                base, override_percent
            ))
        } else if let Some(until) = paused_until {
            Some(format!("override suspended until {}", until))
        } else {
            None
        };

        match skip_reason {
            Some(reason) => {
                self.weather_audit(audit, trigger, AuditEventKind::ForcedChargeSkipped, reason)
                    .await;
                base
            }
            None => {
                info!(
                    "Bad weather at site {}: raising reserve from {}% to {}%",
                    trigger.site_id, base, override_percent
                );
                self.weather_audit(
                    audit,
                    trigger,
                    AuditEventKind::ForcedChargeInitiated,
                    format!("reserve raised from {}% to {}%", base, override_percent),
                )
                .await;
                override_percent
            }
        }
    }

    async fn set_reserve(&self, trigger: &Trigger, percent: i32) -> Result<(), GuardedCallError> {
        let device = &self.device;
        let site_id = trigger.site_id.as_str();
        self.call_device(trigger, |token: String| async move {
            device.set_reserve_percent(site_id, percent, &token).await
        })
        .await
    }

    async fn read_reserve(&self, trigger: &Trigger) -> Result<i32, GuardedCallError> {
        let device = &self.device;
        let site_id = trigger.site_id.as_str();
        self.call_device(trigger, |token: String| async move {
            device.get_reserve_percent(site_id, &token).await
        })
        .await
    }

    /// Runs a Device API call with the user's token. The firing gets one
    /// retry in total: either a refresh and retry after an auth rejection,
    /// or a pause and retry after a transient failure. Whatever the retry
    /// returns is final.
    async fn call_device<T, F, Fut>(
        &self,
        trigger: &Trigger,
        operation: F,
    ) -> Result<T, GuardedCallError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let user_id = trigger.user_id;
        let timeout = self.settings.device_timeout;
        let timed = |token: String| {
            let call = operation(token);
            async move {
                tokio::time::timeout(timeout, call)
                    .await
                    .unwrap_or(Err(DeviceError::Timeout))
            }
        };

        let first = match self.credentials.get_valid_access_token(user_id).await {
            Ok(token) => match timed(token.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() => {
                    return self.credentials.handle_unauthorized(user_id, &token, &timed).await;
                }
                Err(e) => GuardedCallError::from(e),
            },
            Err(e) => GuardedCallError::from(e),
        };
        if !first.is_transient() {
            return Err(first);
        }

        warn!(
            "Transient failure calling site {}, retrying once: {}",
            trigger.site_id, first
        );
        tokio::time::sleep(self.settings.transient_retry_delay).await;
        let token = self.credentials.get_valid_access_token(user_id).await?;
        timed(token).await.map_err(GuardedCallError::from)
    }

    async fn finish(
        &self,
        trigger: &Trigger,
        execution_type: ExecutionType,
        scheduled_for: Option<DateTime<Utc>>,
        outcome: Outcome,
    ) -> Outcome {
        match &outcome {
            Outcome::Applied { percent } => info!(
                "Trigger '{}' ({}) set site {} reserve to {}% [{}]",
                trigger.name,
                trigger.event_kind.as_str(),
                trigger.site_id,
                percent,
                execution_type.as_str()
            ),
            Outcome::Skipped { reason } => {
                info!("Trigger '{}' skipped: {}", trigger.name, reason)
            }
            Outcome::Failed { error } => error!(
                "Trigger '{}' ({}) failed for site {}: {}",
                trigger.name, trigger.id, trigger.site_id, error
            ),
        }

        let record = ExecutionRecord {
            trigger_id: trigger.id,
            group_id: trigger.group_id,
            user_id: trigger.user_id,
            trigger_name: trigger.name.clone(),
            recurrence: trigger.recurrence.clone(),
            scheduled_for,
            executed_at: Utc::now(),
            status: outcome.status(),
            execution_type,
            applied_percent: match &outcome {
                Outcome::Applied { percent } => Some(*percent),
                _ => None,
            },
            details: outcome.describe(),
        };
        if let Err(e) = self.history.record(record).await {
            error!("Failed to record execution of trigger {}: {}", trigger.id, e);
        }

        match &outcome {
            Outcome::Applied { .. } => {
                self.record_audit(trigger, AuditEventKind::EvaluationSuccess, outcome.describe())
                    .await
            }
            Outcome::Failed { .. } => {
                self.record_audit(trigger, AuditEventKind::EvaluationFailure, outcome.describe())
                    .await
            }
            Outcome::Skipped { .. } => {}
        }
        outcome
    }

    async fn weather_audit(
        &self,
        audit: bool,
        trigger: &Trigger,
        kind: AuditEventKind,
        detail: impl Into<String>,
    ) {
        if audit {
            self.record_audit(trigger, kind, detail).await;
        }
    }

    async fn record_audit(&self, trigger: &Trigger, kind: AuditEventKind, detail: impl Into<String>) {
        let event = AuditEvent::new(trigger.user_id, Some(&trigger.site_id), kind, detail);
        if let Err(e) = self.audit.append(event).await {
            error!("Failed to append {} audit event: {}", kind.as_str(), e);
        }
    }
}

fn failure_detail(err: &GuardedCallError) -> String {
    match err {
        GuardedCallError::Credential(CredentialError::ReauthenticationRequired(_)) => {
            "user must reconnect their account".to_string()
        }
        other => other.to_string(),
    }
}

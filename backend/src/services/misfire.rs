use crate::error::StoreError;
use crate::models::{ExecutionType, Trigger};
use crate::services::executor::{Outcome, ReconciliationExecutor};
use crate::services::trigger_compiler::Recurrence;
use crate::store::{ExecutionHistoryStore, TriggerStore};
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MisfireReport {
    pub replayed: usize,
    pub stale: usize,
    pub up_to_date: usize,
    pub unschedulable: usize,
}

/// Startup catch-up for firings missed while the process was down.
pub struct MisfireRecoveryService {
    triggers: Arc<dyn TriggerStore>,
    history: Arc<dyn ExecutionHistoryStore>,
    executor: Arc<ReconciliationExecutor>,
    grace: Duration,
}

impl MisfireRecoveryService {
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        history: Arc<dyn ExecutionHistoryStore>,
        executor: Arc<ReconciliationExecutor>,
        grace: std::time::Duration,
    ) -> Self {
        Self {
            triggers,
            history,
            executor,
            grace: Duration::from_std(grace).unwrap_or_else(|_| Duration::hours(1)),
        }
    }

    /// Replays, oldest first, the latest missed instant of every enabled
    /// trigger that is still within the grace window. Each trigger is
    /// replayed at most once.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<MisfireReport, StoreError> {
        let mut report = MisfireReport::default();
        let mut due: Vec<(DateTime<Utc>, Trigger)> = Vec::new();

        for trigger in self.triggers.list_enabled().await? {
            let recurrence = match Recurrence::for_trigger(&trigger) {
                Ok(r) => r,
                Err(e) => {
                    error!("Skipping misfire check for {}: {}", trigger.name, e);
                    report.unschedulable += 1;
                    continue;
                }
            };

            let Some(missed) = recurrence.previous_before(now) else {
                report.up_to_date += 1;
                continue;
            };
            if missed < trigger.created_at || !trigger.is_within_bounds(missed) {
                report.up_to_date += 1;
                continue;
            }
            if let Some(last) = self.history.last_success(trigger.id).await? {
                if last >= missed {
                    report.up_to_date += 1;
                    continue;
                }
            }
            if now - missed > self.grace {
                warn!(
                    "Not replaying {} ({}) missed at {}: older than the {} minute grace window",
                    trigger.name,
                    trigger.id,
                    missed,
                    self.grace.num_minutes()
                );
                report.stale += 1;
                continue;
            }
            due.push((missed, trigger));
        }

        due.sort_by_key(|(missed, _)| *missed);
        for (missed, trigger) in due {
            info!("Replaying {} ({}) missed at {}", trigger.name, trigger.id, missed);
            let outcome = self
                .executor
                .execute(&trigger, ExecutionType::MisfireReplay, Some(missed))
                .await;
            if let Outcome::Failed { error } = &outcome {
                warn!("Replay of {} failed: {}", trigger.name, error);
            }
            report.replayed += 1;
        }

        info!(
            "Misfire recovery: {} replayed, {} stale, {} up to date, {} unschedulable",
            report.replayed, report.stale, report.up_to_date, report.unschedulable
        );
        Ok(report)
    }
}

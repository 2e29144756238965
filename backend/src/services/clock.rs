use crate::config::BacklogPolicy;
use crate::error::ClockError;
use crate::models::{EventKind, ExecutionType, ReconciliationMode, Trigger};
use crate::services::executor::{Outcome, ReconciliationExecutor};
use crate::services::rules::TriggerChangeListener;
use crate::services::trigger_compiler::{PeakWindow, Period, Recurrence};
use crate::store::TriggerStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Scheduled,
    Firing,
    Disabled,
}

/// What happened when the clock asked for a trigger to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireResult {
    Executed(Outcome),
    /// A previous firing of the same trigger was still running.
    Busy,
    /// The trigger was deleted or disabled after it was scheduled.
    Inactive,
}

struct Slot {
    gate: Mutex<()>,
    state: Mutex<TriggerState>,
}

/// Runs firings one at a time per trigger. Different triggers never wait on each other.
pub struct Dispatcher {
    triggers: Arc<dyn TriggerStore>,
    executor: Arc<ReconciliationExecutor>,
    policy: BacklogPolicy,
    slots: Mutex<HashMap<Uuid, Arc<Slot>>>,
}

impl Dispatcher {
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        executor: Arc<ReconciliationExecutor>,
        policy: BacklogPolicy,
    ) -> Self {
        Self {
            triggers,
            executor,
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn state(&self, trigger_id: Uuid) -> Option<TriggerState> {
        let slot = self.slots.lock().await.get(&trigger_id).cloned()?;
        let state = *slot.state.lock().await;
        Some(state)
    }

    async fn slot(&self, trigger_id: Uuid) -> Arc<Slot> {
        self.slots
            .lock()
            .await
            .entry(trigger_id)
            .or_insert_with(|| {
                Arc::new(Slot {
                    gate: Mutex::new(()),
                    state: Mutex::new(TriggerState::Scheduled),
                })
            })
            .clone()
    }

    async fn mark(&self, trigger_id: Uuid, state: TriggerState) {
        let slot = self.slot(trigger_id).await;
        *slot.state.lock().await = state;
    }

    /// Fires the trigger as of `fired_at`, re-reading it from the store first.
    pub async fn fire(&self, trigger_id: Uuid, fired_at: DateTime<Utc>) -> FireResult {
        let trigger = match self.triggers.find(trigger_id).await {
            Ok(Some(trigger)) if trigger.enabled => trigger,
            Ok(_) => {
                log::info!("Trigger {} is no longer active, not firing", trigger_id);
                self.mark(trigger_id, TriggerState::Disabled).await;
                return FireResult::Inactive;
            }
            Err(e) => {
                log::error!("Could not load trigger {}: {}", trigger_id, e);
                return FireResult::Inactive;
            }
        };

        let slot = self.slot(trigger_id).await;
        let _gate = match self.policy {
            BacklogPolicy::Skip => match slot.gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    log::warn!(
                        "Trigger {} ({}) is still running, skipping this firing",
                        trigger.name,
                        trigger_id
                    );
                    return FireResult::Busy;
                }
            },
            BacklogPolicy::Queue => slot.gate.lock().await,
        };

        *slot.state.lock().await = TriggerState::Firing;
        let scheduled_for = Recurrence::for_trigger(&trigger)
            .ok()
            .and_then(|r| r.previous_before(fired_at + Duration::seconds(1)));
        let outcome = self
            .executor
            .execute(&trigger, ExecutionType::Regular, scheduled_for)
            .await;
        *slot.state.lock().await = TriggerState::Scheduled;

        FireResult::Executed(outcome)
    }

    /// Re-asserts every site that has a CONTINUOUS rule in force. Rules of
    /// one site are combined first: on-peak wins over off-peak, the lowest
    /// on-peak target or else the highest off-peak target applies, so each
    /// site is checked once per pass. Returns how many sites were checked.
    pub async fn reassert_all(&self, now: DateTime<Utc>) -> Result<usize, ClockError> {
        let enabled = self.triggers.list_enabled().await?;
        let mut groups: HashMap<Uuid, Vec<Trigger>> = HashMap::new();
        for trigger in enabled {
            groups.entry(trigger.group_id).or_default().push(trigger);
        }

        let mut sites: HashMap<(i32, String), Vec<(Period, &Trigger)>> = HashMap::new();
        for group in groups.values() {
            if let Some((period, active)) = active_trigger(group, now) {
                sites
                    .entry((active.user_id, active.site_id.clone()))
                    .or_default()
                    .push((period, active));
            }
        }

        let mut checked = 0;
        for candidates in sites.values() {
            let Some(winner) = winning_trigger(candidates) else {
                continue;
            };
            let slot = self.slot(winner.id).await;
            // A boundary firing in progress already enforces the target.
            let Ok(_gate) = slot.gate.try_lock() else {
                continue;
            };
            self.executor.reassert(winner).await;
            checked += 1;
        }
        Ok(checked)
    }
}

/// The CONTINUOUS trigger of a group that governs `now`, with its period.
/// On-peak it is the START_DISCHARGE trigger; off-peak it is the START_CHARGE
/// trigger, or an override in its validity window. `None` when the rule is
/// one-shot, disabled or doesn't run on the local weekday.
pub fn active_trigger(group: &[Trigger], now: DateTime<Utc>) -> Option<(Period, &Trigger)> {
    let period = PeakWindow::for_group(group)?.period_at(now)?;
    let kind = match period {
        Period::OnPeak => EventKind::StartDischarge,
        Period::OffPeak => EventKind::StartCharge,
    };
    let eligible = |t: &&Trigger| {
        t.event_kind == kind
            && t.enabled
            && t.mode == ReconciliationMode::Continuous
            && t.is_within_bounds(now)
    };
    let overriding = group
        .iter()
        .filter(eligible)
        .filter(|t| t.is_override())
        .max_by_key(|t| t.created_at);
    let active = overriding.or_else(|| group.iter().filter(eligible).find(|t| !t.is_override()))?;
    Some((period, active))
}

/// Combines the active triggers of one site into the one to enforce.
fn winning_trigger<'a>(candidates: &[(Period, &'a Trigger)]) -> Option<&'a Trigger> {
    let on_peak = candidates
        .iter()
        .filter(|(period, _)| *period == Period::OnPeak)
        .map(|(_, t)| *t)
        .min_by_key(|t| t.target_percent);
    on_peak.or_else(|| {
        candidates
            .iter()
            .map(|(_, t)| *t)
            .max_by_key(|t| t.target_percent)
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub scheduled: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub unschedulable: usize,
}

struct RegisteredJob {
    job_id: Uuid,
    recurrence: String,
    timezone: String,
}

fn scheduler_error(e: JobSchedulerError) -> ClockError {
    ClockError::Scheduler(format!("{:?}", e))
}

/// Cron-driven clock: one job per enabled trigger plus the periodic
/// maintenance jobs registered by the daemon.
pub struct ReconciliationClock {
    scheduler: JobScheduler,
    triggers: Arc<dyn TriggerStore>,
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<HashMap<Uuid, RegisteredJob>>,
}

impl ReconciliationClock {
    pub async fn new(
        triggers: Arc<dyn TriggerStore>,
        executor: Arc<ReconciliationExecutor>,
        policy: BacklogPolicy,
    ) -> Result<Self, ClockError> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        let dispatcher = Arc::new(Dispatcher::new(triggers.clone(), executor, policy));
        Ok(Self {
            scheduler,
            triggers,
            dispatcher,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn state(&self, trigger_id: Uuid) -> Option<TriggerState> {
        self.dispatcher.state(trigger_id).await
    }

    /// Brings the registered jobs in line with the enabled triggers in the store.
    pub async fn sync(&self) -> Result<SyncReport, ClockError> {
        let enabled = self.triggers.list_enabled().await?;
        let wanted: HashSet<Uuid> = enabled.iter().map(|t| t.id).collect();
        let mut jobs = self.jobs.lock().await;
        let mut report = SyncReport::default();

        let stale: Vec<Uuid> = jobs.keys().filter(|id| !wanted.contains(id)).copied().collect();
        for trigger_id in stale {
            if let Some(job) = jobs.remove(&trigger_id) {
                self.scheduler.remove(&job.job_id).await.map_err(scheduler_error)?;
                self.dispatcher.mark(trigger_id, TriggerState::Disabled).await;
                report.removed += 1;
            }
        }

        for trigger in enabled {
            if let Some(existing) = jobs.get(&trigger.id) {
                if existing.recurrence == trigger.recurrence && existing.timezone == trigger.timezone {
                    report.unchanged += 1;
                    continue;
                }
                self.scheduler
                    .remove(&existing.job_id)
                    .await
                    .map_err(scheduler_error)?;
                jobs.remove(&trigger.id);
            }

            match self.register(&trigger).await {
                Ok(job_id) => {
                    jobs.insert(
                        trigger.id,
                        RegisteredJob {
                            job_id,
                            recurrence: trigger.recurrence.clone(),
                            timezone: trigger.timezone.clone(),
                        },
                    );
                    self.dispatcher.mark(trigger.id, TriggerState::Scheduled).await;
                    report.scheduled += 1;
                }
                Err(e) => {
                    log::error!("Trigger {} ({}) not scheduled: {}", trigger.name, trigger.id, e);
                    report.unschedulable += 1;
                }
            }
        }

        log::info!(
            "Clock synced: {} scheduled, {} unchanged, {} removed, {} unschedulable",
            report.scheduled,
            report.unchanged,
            report.removed,
            report.unschedulable
        );
        Ok(report)
    }

    async fn register(&self, trigger: &Trigger) -> Result<Uuid, ClockError> {
        let recurrence = Recurrence::for_trigger(trigger)
            .map_err(|e| ClockError::Scheduler(e.to_string()))?;
        let dispatcher = self.dispatcher.clone();
        let trigger_id = trigger.id;
        let job = Job::new_async_tz(
            trigger.recurrence.as_str(),
            recurrence.timezone(),
            move |_uuid, _l| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    dispatcher.fire(trigger_id, Utc::now()).await;
                })
            },
        )
        .map_err(scheduler_error)?;
        let job_id = self.scheduler.add(job).await.map_err(scheduler_error)?;
        log::debug!(
            "Scheduled {} ({}) '{}' in {}, next at {:?}",
            trigger.name,
            trigger.event_kind.as_str(),
            trigger.recurrence,
            trigger.timezone,
            recurrence.next_after(Utc::now())
        );
        Ok(job_id)
    }

    /// Registers a maintenance task on a UTC cron expression.
    pub async fn schedule_task<F, Fut>(
        &self,
        cron: &str,
        name: &'static str,
        task: F,
    ) -> Result<Uuid, ClockError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let task = task.clone();
            Box::pin(async move {
                log::debug!("Scheduled {} triggered", name);
                task().await;
            })
        })
        .map_err(scheduler_error)?;
        let job_id = self.scheduler.add(job).await.map_err(scheduler_error)?;
        log::info!("  - {}: {}", name, cron);
        Ok(job_id)
    }

    pub async fn schedule_reassertion(&self, cron: &str) -> Result<Uuid, ClockError> {
        let dispatcher = self.dispatcher.clone();
        self.schedule_task(cron, "reassert", move || {
            let dispatcher = dispatcher.clone();
            async move {
                match dispatcher.reassert_all(Utc::now()).await {
                    Ok(checked) => log::debug!("Re-asserted {} sites", checked),
                    Err(e) => log::error!("Re-assertion pass failed: {}", e),
                }
            }
        })
        .await
    }

    /// Periodic `sync`, so changes made by other processes are picked up.
    pub async fn schedule_resync(self: &Arc<Self>, cron: &str) -> Result<Uuid, ClockError> {
        let clock: Weak<Self> = Arc::downgrade(self);
        self.schedule_task(cron, "resync", move || {
            let clock = clock.clone();
            async move {
                if let Some(clock) = clock.upgrade() {
                    if let Err(e) = clock.sync().await {
                        log::error!("Clock resync failed: {}", e);
                    }
                }
            }
        })
        .await
    }

    pub async fn start(&self) -> Result<(), ClockError> {
        self.scheduler.start().await.map_err(scheduler_error)
    }

    /// Stops scheduling new firings. Firings already running finish on their own.
    pub async fn shutdown(&self) -> Result<(), ClockError> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await.map_err(scheduler_error)
    }
}

#[async_trait]
impl TriggerChangeListener for ReconciliationClock {
    async fn triggers_changed(&self) {
        if let Err(e) = self.sync().await {
            log::error!("Clock resync after rule change failed: {}", e);
        }
    }
}

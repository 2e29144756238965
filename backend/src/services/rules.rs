use crate::error::{RuleError, ValidationError};
use crate::models::{EventKind, Rule, RuleSummary, Trigger};
use crate::services::trigger_compiler::{compile, recurrence_expression, MIN_RESERVE_PERCENT};
use crate::store::TriggerStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound for override triggers, which may fill the battery completely.
pub const MAX_OVERRIDE_PERCENT: i32 = 100;

/// Notified after any change to the stored trigger set.
#[async_trait]
pub trait TriggerChangeListener: Send + Sync {
    async fn triggers_changed(&self);
}

/// User-facing rule edits. Every edit touches a whole trigger group at once.
pub struct RuleService {
    triggers: Arc<dyn TriggerStore>,
    listener: Option<Arc<dyn TriggerChangeListener>>,
}

impl RuleService {
    pub fn new(triggers: Arc<dyn TriggerStore>) -> Self {
        Self {
            triggers,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TriggerChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    async fn notify(&self) {
        if let Some(listener) = &self.listener {
            listener.triggers_changed().await;
        }
    }

    /// Validates and compiles `rule`, returning the new group id.
    pub async fn create(&self, rule: &Rule) -> Result<Uuid, RuleError> {
        let triggers = compile(rule, None, Utc::now())?;
        let group_id = triggers[0].group_id;
        self.triggers.replace_group(group_id, triggers.to_vec()).await?;
        info!("Created rule '{}' (group {}) for user {}", rule.name, group_id, rule.user_id);
        self.notify().await;
        Ok(group_id)
    }

    /// Recompiles a group owned by `user_id`. The group stays with its owner
    /// whatever `rule.user_id` says.
    pub async fn update(&self, user_id: i32, group_id: Uuid, rule: &Rule) -> Result<(), RuleError> {
        self.owned_group(user_id, group_id).await?;
        let rule = Rule {
            user_id,
            ..rule.clone()
        };
        let triggers = compile(&rule, Some(group_id), Utc::now())?;
        self.triggers.replace_group(group_id, triggers.to_vec()).await?;
        info!("Updated rule '{}' (group {})", rule.name, group_id);
        self.notify().await;
        Ok(())
    }

    /// Deletes the group's triggers. Execution history is kept.
    pub async fn delete(&self, user_id: i32, group_id: Uuid) -> Result<(), RuleError> {
        self.owned_group(user_id, group_id).await?;
        if self.triggers.delete_group(group_id).await? == 0 {
            return Err(RuleError::NotFound(group_id));
        }
        info!("Deleted rule group {}", group_id);
        self.notify().await;
        Ok(())
    }

    pub async fn set_enabled(
        &self,
        user_id: i32,
        group_id: Uuid,
        enabled: bool,
    ) -> Result<(), RuleError> {
        self.owned_group(user_id, group_id).await?;
        if self.triggers.set_group_enabled(group_id, enabled).await? == 0 {
            return Err(RuleError::NotFound(group_id));
        }
        info!(
            "Rule group {} {}",
            group_id,
            if enabled { "enabled" } else { "disabled" }
        );
        self.notify().await;
        Ok(())
    }

    /// The group's triggers. Someone else's group is reported as missing.
    async fn owned_group(&self, user_id: i32, group_id: Uuid) -> Result<Vec<Trigger>, RuleError> {
        let group = self.triggers.find_group(group_id).await?;
        if group.is_empty() {
            return Err(RuleError::NotFound(group_id));
        }
        if group.iter().any(|t| t.user_id != user_id) {
            warn!("User {} tried to change rule group {} of another user", user_id, group_id);
            return Err(RuleError::NotFound(group_id));
        }
        Ok(group)
    }

    /// The user's rules rebuilt from their trigger groups.
    pub async fn list(&self, user_id: i32) -> Result<Vec<RuleSummary>, RuleError> {
        let now = Utc::now();
        let mut groups: HashMap<Uuid, Vec<Trigger>> = HashMap::new();
        for trigger in self.triggers.list_for_user(user_id).await? {
            groups.entry(trigger.group_id).or_default().push(trigger);
        }

        let mut summaries: Vec<RuleSummary> = groups
            .into_iter()
            .filter_map(|(group_id, group)| {
                let summary = summarize(group_id, &group, now);
                if summary.is_none() {
                    warn!("Trigger group {} is missing a boundary trigger", group_id);
                }
                summary
            })
            .collect();
        summaries.sort_by(|a, b| a.rule.name.cmp(&b.rule.name).then(a.group_id.cmp(&b.group_id)));
        Ok(summaries)
    }

    /// Adds a transient START_CHARGE trigger to an existing group, firing at
    /// `time_of_day` on the rule's days between `valid_from` and `valid_to`.
    pub async fn add_override(
        &self,
        user_id: i32,
        group_id: Uuid,
        percent: i32,
        time_of_day: NaiveTime,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
    ) -> Result<Uuid, RuleError> {
        if !(MIN_RESERVE_PERCENT..=MAX_OVERRIDE_PERCENT).contains(&percent) {
            return Err(ValidationError::PercentOutOfRange {
                field: "override",
                value: percent,
                min: MIN_RESERVE_PERCENT,
                max: MAX_OVERRIDE_PERCENT,
            }
            .into());
        }
        if valid_to <= valid_from {
            return Err(ValidationError::EmptyWindow.into());
        }

        let group = self.owned_group(user_id, group_id).await?;
        let base = group
            .iter()
            .find(|t| !t.is_override() && t.event_kind == EventKind::StartCharge)
            .ok_or(RuleError::NotFound(group_id))?;

        let trigger = Trigger {
            id: Uuid::new_v4(),
            event_kind: EventKind::StartCharge,
            time_of_day,
            target_percent: percent,
            recurrence: recurrence_expression(&base.weekdays, time_of_day),
            valid_from: Some(valid_from),
            valid_to: Some(valid_to),
            created_at: Utc::now(),
            ..base.clone()
        };
        let id = trigger.id;
        self.triggers.insert_override(trigger).await?;
        info!(
            "Override {}% added to group {} from {} to {}",
            percent, group_id, valid_from, valid_to
        );
        self.notify().await;
        Ok(id)
    }

    /// Deletes overrides whose validity window has ended.
    pub async fn purge_expired_overrides(&self, now: DateTime<Utc>) -> Result<usize, RuleError> {
        let purged = self.triggers.delete_expired(now).await?;
        if purged > 0 {
            info!("Purged {} expired override triggers", purged);
            self.notify().await;
        }
        Ok(purged)
    }
}

fn summarize(group_id: Uuid, group: &[Trigger], now: DateTime<Utc>) -> Option<RuleSummary> {
    let permanent = |kind: EventKind| group.iter().find(|t| !t.is_override() && t.event_kind == kind);
    let discharge = permanent(EventKind::StartDischarge)?;
    let charge = permanent(EventKind::StartCharge)?;
    let override_percent = group
        .iter()
        .filter(|t| t.is_override() && t.is_within_bounds(now))
        .max_by_key(|t| t.created_at)
        .map(|t| t.target_percent);

    Some(RuleSummary {
        group_id,
        rule: Rule {
            user_id: discharge.user_id,
            site_id: discharge.site_id.clone(),
            name: discharge.name.clone(),
            description: discharge.description.clone(),
            weekdays: discharge.weekdays,
            start_time: discharge.time_of_day,
            end_time: charge.time_of_day,
            timezone: discharge.timezone.clone(),
            on_peak_percent: discharge.target_percent,
            off_peak_percent: charge.target_percent,
            mode: discharge.mode,
            enabled: discharge.enabled && charge.enabled,
        },
        override_percent,
    })
}

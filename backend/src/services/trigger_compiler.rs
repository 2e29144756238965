//! Rule -> Trigger compilation and recurrence arithmetic.
//!
//! A Rule compiles to exactly two boundary Triggers sharing a group id:
//! START_DISCHARGE at the start time with the on-peak percent and
//! START_CHARGE at the end time with the off-peak percent. Rules whose end
//! time is before their start time (crossing midnight) compile the same way.

use crate::error::{ConfigurationError, ValidationError};
use crate::models::{EventKind, Rule, Trigger, WeekdaySet};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

pub const MIN_RESERVE_PERCENT: i32 = 5;
pub const MAX_RESERVE_PERCENT: i32 = 80;

pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.parse::<Tz>()
        .map_err(|_| ValidationError::UnknownTimezone(name.to_string()))
}

fn check_percent(field: &'static str, value: i32) -> Result<(), ValidationError> {
    if (MIN_RESERVE_PERCENT..=MAX_RESERVE_PERCENT).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::PercentOutOfRange {
            field,
            value,
            min: MIN_RESERVE_PERCENT,
            max: MAX_RESERVE_PERCENT,
        })
    }
}

pub fn validate(rule: &Rule) -> Result<(), ValidationError> {
    if rule.name.trim().is_empty() {
        return Err(ValidationError::Blank("name"));
    }
    if rule.site_id.trim().is_empty() {
        return Err(ValidationError::Blank("site id"));
    }
    if rule.weekdays.is_empty() {
        return Err(ValidationError::EmptyWeekdays);
    }
    check_percent("on-peak", rule.on_peak_percent)?;
    check_percent("off-peak", rule.off_peak_percent)?;
    if rule.start_time == rule.end_time {
        return Err(ValidationError::StartEqualsEnd);
    }
    parse_timezone(&rule.timezone)?;
    Ok(())
}

/// Six-field cron (`sec min hour dom month dow`) firing at `time` on each day of `weekdays`.
pub fn recurrence_expression(weekdays: &WeekdaySet, time: NaiveTime) -> String {
    format!(
        "{} {} {} * * {}",
        time.second(),
        time.minute(),
        time.hour(),
        weekdays.to_cron()
    )
}

/// Compiles a Rule into its two boundary Triggers.
///
/// `group_id` is kept when editing an existing Rule; a fresh one is generated otherwise.
pub fn compile(
    rule: &Rule,
    group_id: Option<Uuid>,
    created_at: DateTime<Utc>,
) -> Result<[Trigger; 2], ValidationError> {
    validate(rule)?;
    let group_id = group_id.unwrap_or_else(Uuid::new_v4);

    let boundary = |event_kind: EventKind, time_of_day: NaiveTime, target_percent: i32| Trigger {
        id: Uuid::new_v4(),
        group_id,
        user_id: rule.user_id,
        site_id: rule.site_id.clone(),
        name: rule.name.clone(),
        description: rule.description.clone(),
        weekdays: rule.weekdays,
        timezone: rule.timezone.clone(),
        enabled: rule.enabled,
        event_kind,
        time_of_day,
        target_percent,
        recurrence: recurrence_expression(&rule.weekdays, time_of_day),
        valid_from: None,
        valid_to: None,
        mode: rule.mode,
        created_at,
    };

    Ok([
        boundary(EventKind::StartDischarge, rule.start_time, rule.on_peak_percent),
        boundary(EventKind::StartCharge, rule.end_time, rule.off_peak_percent),
    ])
}

/// When a Trigger fires, resolved in its own timezone.
#[derive(Debug, Clone)]
pub struct Recurrence {
    tz: Tz,
    weekdays: WeekdaySet,
    time: NaiveTime,
}

impl Recurrence {
    pub fn for_trigger(trigger: &Trigger) -> Result<Self, ConfigurationError> {
        let unschedulable = |reason: String| ConfigurationError::Unschedulable {
            trigger_id: trigger.id,
            reason,
        };
        let tz = parse_timezone(&trigger.timezone).map_err(|e| unschedulable(e.to_string()))?;
        if trigger.weekdays.is_empty() {
            return Err(unschedulable("no weekdays".to_string()));
        }
        Ok(Self {
            tz,
            weekdays: trigger.weekdays,
            time: trigger.time_of_day,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The instant this recurrence fires on `date`, if `date` is one of its days.
    ///
    /// Ambiguous local times (DST fall-back) resolve to the earlier instant;
    /// times skipped by a DST jump fire an hour later.
    fn instant_on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        if !self.weekdays.contains(date.weekday()) {
            return None;
        }
        let local = date.and_time(self.time);
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| self.tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Most recent firing strictly before `before`.
    pub fn previous_before(&self, before: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = before.with_timezone(&self.tz).date_naive();
        (0..=8)
            .filter_map(|back| today.checked_sub_signed(Duration::days(back)))
            .filter_map(|date| self.instant_on(date))
            .find(|instant| *instant < before)
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.with_timezone(&self.tz).date_naive();
        (0..=8)
            .filter_map(|ahead| today.checked_add_signed(Duration::days(ahead)))
            .filter_map(|date| self.instant_on(date))
            .find(|instant| *instant > after)
    }
}

/// Which half of a rule's day is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    OnPeak,
    OffPeak,
}

/// A rule's on-peak window `[start, end)` in its own timezone. When `end`
/// is not after `start` the window wraps past midnight.
#[derive(Debug, Clone)]
pub struct PeakWindow {
    tz: Tz,
    weekdays: WeekdaySet,
    start: NaiveTime,
    end: NaiveTime,
}

impl PeakWindow {
    /// Built from a group's permanent START_DISCHARGE and START_CHARGE triggers.
    pub fn for_group(group: &[Trigger]) -> Option<Self> {
        let permanent = |kind: EventKind| group.iter().find(|t| !t.is_override() && t.event_kind == kind);
        let discharge = permanent(EventKind::StartDischarge)?;
        let charge = permanent(EventKind::StartCharge)?;
        Some(Self {
            tz: parse_timezone(&discharge.timezone).ok()?,
            weekdays: discharge.weekdays,
            start: discharge.time_of_day,
            end: charge.time_of_day,
        })
    }

    /// The period in force at `now`, or `None` when the rule doesn't run on
    /// the local weekday.
    pub fn period_at(&self, now: DateTime<Utc>) -> Option<Period> {
        let local = now.with_timezone(&self.tz);
        if !self.weekdays.contains(local.weekday()) {
            return None;
        }
        let time = local.time();
        let on_peak = if self.start < self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        };
        Some(if on_peak { Period::OnPeak } else { Period::OffPeak })
    }
}

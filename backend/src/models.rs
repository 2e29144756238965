use crate::error::RefreshError;
use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Set of weekdays, stored as a bitmask with Monday as bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        days.iter().fold(Self::empty(), |mut set, day| {
            set.insert(*day);
            set
        })
    }

    pub fn weekdays() -> Self {
        Self::from_days(&ALL_DAYS[..5])
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Days in Monday..Sunday order.
    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        ALL_DAYS.iter().copied().filter(|d| self.contains(*d))
    }

    /// Day list in cron notation, e.g. `MON,TUE,WED`. Also the storage form.
    pub fn to_cron(&self) -> String {
        self.iter()
            .map(|d| d.to_string().to_uppercase())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for WeekdaySet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = Self::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let day = part
                .parse::<Weekday>()
                .map_err(|_| format!("invalid weekday '{}'", part))?;
            set.insert(day);
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Boundary at the rule's start time, on-peak percent.
    StartDischarge,
    /// Boundary at the rule's end time, off-peak percent.
    StartCharge,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StartDischarge => "START_DISCHARGE",
            EventKind::StartCharge => "START_CHARGE",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "START_DISCHARGE" => Ok(EventKind::StartDischarge),
            "START_CHARGE" => Ok(EventKind::StartCharge),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationMode {
    #[default]
    Continuous,
    OneShot,
}

impl ReconciliationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationMode::Continuous => "CONTINUOUS",
            ReconciliationMode::OneShot => "ONE_SHOT",
        }
    }

    /// Anything other than `CONTINUOUS` fires once at its boundary.
    pub fn from_db(s: &str) -> Self {
        if s.eq_ignore_ascii_case("CONTINUOUS") {
            ReconciliationMode::Continuous
        } else {
            ReconciliationMode::OneShot
        }
    }
}

/// A user's weekly reserve-percent rule. Persisted only as its compiled Trigger group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub user_id: i32,
    pub site_id: String,
    pub name: String,
    pub description: Option<String>,
    pub weekdays: WeekdaySet,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub on_peak_percent: i32,
    pub off_peak_percent: i32,
    pub mode: ReconciliationMode,
    pub enabled: bool,
}

/// A Rule rebuilt from its persisted Trigger group.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub group_id: Uuid,
    pub rule: Rule,
    /// Percent of an override Trigger currently replacing the off-peak percent.
    pub override_percent: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub group_id: Uuid,
    pub user_id: i32,
    pub site_id: String,
    pub name: String,
    pub description: Option<String>,
    pub weekdays: WeekdaySet,
    pub timezone: String,
    pub enabled: bool,
    pub event_kind: EventKind,
    pub time_of_day: NaiveTime,
    pub target_percent: i32,
    pub recurrence: String,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub mode: ReconciliationMode,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// Transient triggers carry a validity window; permanent ones don't.
    pub fn is_override(&self) -> bool {
        self.valid_from.is_some() || self.valid_to.is_some()
    }

    pub fn is_within_bounds(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| at >= from) && self.valid_to.is_none_or(|to| at <= to)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_to.is_some_and(|to| to < now)
    }
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trigger {}

impl Hash for Trigger {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Token pair returned by the authorization server.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_expires_in: Option<i64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// A persisted credential row. The most recent row per user is authoritative;
/// earlier rows are kept as history.
#[derive(Clone)]
pub struct Credential {
    pub id: i64,
    pub user_id: i32,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn access_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.access_expires_at > at
    }

    pub fn refresh_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.refresh_expires_at > at
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct NewCredential {
    pub user_id: i32,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl NewCredential {
    /// `refresh_lifetime` applies when the grant doesn't say how long the refresh token lives.
    /// Lifetimes that don't fit a timestamp are reported as a transport failure.
    pub fn from_grant(
        user_id: i32,
        grant: TokenGrant,
        issued_at: DateTime<Utc>,
        refresh_lifetime: Duration,
    ) -> Result<Self, RefreshError> {
        let access_expires_at = expiry_after(issued_at, grant.expires_in)?;
        let refresh_expires_at = match grant.refresh_expires_in {
            Some(secs) => expiry_after(issued_at, secs)?,
            None => issued_at
                .checked_add_signed(refresh_lifetime)
                .ok_or_else(|| RefreshError::Transport("refresh lifetime out of range".to_string()))?,
        };
        Ok(Self {
            user_id,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            access_expires_at,
            refresh_expires_at,
            token_type: grant.token_type,
            scope: grant.scope,
        })
    }
}

fn expiry_after(issued_at: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>, RefreshError> {
    Duration::try_seconds(secs)
        .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
        .ok_or_else(|| RefreshError::Transport(format!("token lifetime of {}s is out of range", secs)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    Connect,
    Disconnect,
    EvaluationGoodWeather,
    EvaluationBadWeather,
    ForcedChargeInitiated,
    ForcedChargeSkipped,
    EvaluationSuccess,
    EvaluationFailure,
    ForecastFetchSuccess,
    ForecastFetchFailure,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::Connect => "CONNECT",
            AuditEventKind::Disconnect => "DISCONNECT",
            AuditEventKind::EvaluationGoodWeather => "EVALUATION_GOOD_WEATHER",
            AuditEventKind::EvaluationBadWeather => "EVALUATION_BAD_WEATHER",
            AuditEventKind::ForcedChargeInitiated => "FORCED_CHARGE_INITIATED",
            AuditEventKind::ForcedChargeSkipped => "FORCED_CHARGE_SKIPPED",
            AuditEventKind::EvaluationSuccess => "EVALUATION_SUCCESS",
            AuditEventKind::EvaluationFailure => "EVALUATION_FAILURE",
            AuditEventKind::ForecastFetchSuccess => "FORECAST_FETCH_SUCCESS",
            AuditEventKind::ForecastFetchFailure => "FORECAST_FETCH_FAILURE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub user_id: i32,
    pub site_id: Option<String>,
    pub kind: AuditEventKind,
    pub occurred_at: DateTime<Utc>,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(user_id: i32, site_id: Option<&str>, kind: AuditEventKind, detail: impl Into<String>) -> Self {
        Self {
            user_id,
            site_id: site_id.map(str::to_string),
            kind,
            occurred_at: Utc::now(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::Skipped => "SKIPPED",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILURE" => Ok(ExecutionStatus::Failure),
            "SKIPPED" => Ok(ExecutionStatus::Skipped),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Fired by the clock at a recurrence boundary.
    Regular,
    /// Periodic re-assertion of a CONTINUOUS trigger.
    ReconciliationContinuous,
    /// Replayed at startup for an instant missed during downtime.
    MisfireReplay,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Regular => "REGULAR",
            ExecutionType::ReconciliationContinuous => "RECONCILIATION_CONTINUOUS",
            ExecutionType::MisfireReplay => "MISFIRE_REPLAY",
        }
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGULAR" => Ok(ExecutionType::Regular),
            "RECONCILIATION_CONTINUOUS" => Ok(ExecutionType::ReconciliationContinuous),
            "MISFIRE_REPLAY" => Ok(ExecutionType::MisfireReplay),
            other => Err(format!("unknown execution type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub trigger_id: Uuid,
    pub group_id: Uuid,
    pub user_id: i32,
    pub trigger_name: String,
    pub recurrence: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub execution_type: ExecutionType,
    pub applied_percent: Option<i32>,
    pub details: String,
}

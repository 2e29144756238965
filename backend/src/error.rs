use thiserror::Error;
use uuid::Uuid;

/// Bad Rule input, rejected before anything is compiled or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one weekday must be selected")]
    EmptyWeekdays,
    #[error("{field} reserve percent {value} is outside [{min}, {max}]")]
    PercentOutOfRange {
        field: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error("start time and end time must differ")]
    StartEqualsEnd,
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("{0} must not be blank")]
    Blank(&'static str),
    #[error("override window must end after it starts")]
    EmptyWindow,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

/// Failure reported by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The refresh token was refused (expired, revoked or already consumed).
    #[error("refresh token rejected: {0}")]
    Rejected(String),
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user {0} has no connected account")]
    NotConnected(i32),
    #[error("refresh token for user {0} expired or revoked, user must reconnect their account")]
    ReauthenticationRequired(i32),
    #[error("transient refresh failure: {0}")]
    TransientRefresh(String),
    #[error("timed out waiting for the credential lock of user {0}")]
    LockTimeout(i32),
    #[error("unusable token grant: {0}")]
    InvalidGrant(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<diesel::result::Error> for CredentialError {
    fn from(e: diesel::result::Error) -> Self {
        CredentialError::Store(StoreError::Database(e))
    }
}

impl CredentialError {
    /// Whether a caller may retry on its own schedule.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CredentialError::TransientRefresh(_) | CredentialError::LockTimeout(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device API rejected the access token")]
    Unauthorized,
    #[error("rate limited by device API")]
    RateLimited,
    #[error("site {0} unavailable")]
    SiteUnavailable(String),
    #[error("device API call timed out")]
    Timeout,
    #[error("device API error: {0}")]
    Transport(String),
}

impl DeviceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, DeviceError::Unauthorized)
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeviceError::RateLimited | DeviceError::SiteUnavailable(_) | DeviceError::Timeout
        )
    }
}

/// Outcome of a Device API call made through the auth-retry wrapper.
#[derive(Debug, Error)]
pub enum GuardedCallError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl GuardedCallError {
    pub fn is_transient(&self) -> bool {
        match self {
            GuardedCallError::Credential(e) => e.is_transient(),
            GuardedCallError::Device(e) => e.is_transient(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("trigger {trigger_id} is unschedulable: {reason}")]
    Unschedulable { trigger_id: Uuid, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("forecast unavailable: {0}")]
pub struct ForecastError(pub String);

/// Errors surfaced by the Rule CRUD boundary.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rule group {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

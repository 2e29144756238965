use crate::error::{CredentialError, StoreError};
use crate::models::{AuditEvent, Credential, ExecutionRecord, NewCredential, Trigger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

pub mod memory;
pub mod pg;

pub use memory::{MemoryAuditSink, MemoryCredentialStore, MemoryExecutionHistory, MemoryTriggerStore};
pub use pg::PgStore;

/// Compiled trigger persistence. Group operations are all-or-nothing.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Deletes every trigger of `group_id` and inserts `triggers` in one transaction.
    async fn replace_group(&self, group_id: Uuid, triggers: Vec<Trigger>) -> Result<(), StoreError>;

    async fn delete_group(&self, group_id: Uuid) -> Result<usize, StoreError>;

    async fn set_group_enabled(&self, group_id: Uuid, enabled: bool) -> Result<usize, StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<Trigger>, StoreError>;

    async fn find_group(&self, group_id: Uuid) -> Result<Vec<Trigger>, StoreError>;

    async fn list_enabled(&self) -> Result<Vec<Trigger>, StoreError>;

    async fn list_for_user(&self, user_id: i32) -> Result<Vec<Trigger>, StoreError>;

    /// Adds a transient trigger to an existing group.
    async fn insert_override(&self, trigger: Trigger) -> Result<(), StoreError>;

    /// Removes override triggers whose `valid_to` is before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub type RotationFuture =
    Pin<Box<dyn Future<Output = Result<Option<NewCredential>, CredentialError>> + Send>>;

/// Decides, while the current row is locked, what replaces it. `None` keeps it.
pub type Rotation = Box<dyn FnOnce(Credential) -> RotationFuture + Send>;

/// Credential persistence. Rows are append-only; the newest row per user is current.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn latest(&self, user_id: i32) -> Result<Option<Credential>, StoreError>;

    /// Locks the user's newest row, hands it to `rotation` and appends the row
    /// it returns before releasing the lock. Rotations of one user run one at
    /// a time across every process sharing the store. Returns the row that is
    /// current afterwards.
    async fn rotate_latest(
        &self,
        user_id: i32,
        rotation: Rotation,
    ) -> Result<Credential, CredentialError>;

    async fn insert(&self, credential: NewCredential) -> Result<Credential, StoreError>;

    async fn delete_for_user(&self, user_id: i32) -> Result<usize, StoreError>;

    async fn users_with_credentials(&self) -> Result<Vec<i32>, StoreError>;
}

#[async_trait]
pub trait ExecutionHistoryStore: Send + Sync {
    async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    /// Execution instant of the most recent SUCCESS for a trigger.
    async fn last_success(&self, trigger_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Newest first.
    async fn list_for_trigger(
        &self,
        trigger_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError>;
}

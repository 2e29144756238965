//! In-process stores. Used by the test suite and by embedders that don't need Postgres.

use super::{AuditSink, CredentialStore, ExecutionHistoryStore, Rotation, TriggerStore};
use crate::error::{CredentialError, StoreError};
use crate::models::{
    AuditEvent, Credential, ExecutionRecord, ExecutionStatus, NewCredential, Trigger,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryTriggerStore {
    triggers: Mutex<HashMap<Uuid, Trigger>>,
}

impl MemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn replace_group(&self, group_id: Uuid, triggers: Vec<Trigger>) -> Result<(), StoreError> {
        if let Some(stray) = triggers.iter().find(|t| t.group_id != group_id) {
            return Err(StoreError::Conflict(format!(
                "trigger {} does not belong to group {}",
                stray.id, group_id
            )));
        }
        let mut all = self.triggers.lock().await;
        all.retain(|_, t| t.group_id != group_id);
        for trigger in triggers {
            all.insert(trigger.id, trigger);
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: Uuid) -> Result<usize, StoreError> {
        let mut all = self.triggers.lock().await;
        let before = all.len();
        all.retain(|_, t| t.group_id != group_id);
        Ok(before - all.len())
    }

    async fn set_group_enabled(&self, group_id: Uuid, enabled: bool) -> Result<usize, StoreError> {
        let mut all = self.triggers.lock().await;
        let mut count = 0;
        for trigger in all.values_mut().filter(|t| t.group_id == group_id) {
            trigger.enabled = enabled;
            count += 1;
        }
        Ok(count)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Trigger>, StoreError> {
        Ok(self.triggers.lock().await.get(&id).cloned())
    }

    async fn find_group(&self, group_id: Uuid) -> Result<Vec<Trigger>, StoreError> {
        let all = self.triggers.lock().await;
        let mut group: Vec<Trigger> = all.values().filter(|t| t.group_id == group_id).cloned().collect();
        group.sort_by_key(|t| (t.is_override(), t.time_of_day));
        Ok(group)
    }

    async fn list_enabled(&self) -> Result<Vec<Trigger>, StoreError> {
        let all = self.triggers.lock().await;
        Ok(all.values().filter(|t| t.enabled).cloned().collect())
    }

    async fn list_for_user(&self, user_id: i32) -> Result<Vec<Trigger>, StoreError> {
        let all = self.triggers.lock().await;
        Ok(all.values().filter(|t| t.user_id == user_id).cloned().collect())
    }

    async fn insert_override(&self, trigger: Trigger) -> Result<(), StoreError> {
        let mut all = self.triggers.lock().await;
        if !all.values().any(|t| t.group_id == trigger.group_id) {
            return Err(StoreError::NotFound(format!("trigger group {}", trigger.group_id)));
        }
        all.insert(trigger.id, trigger);
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut all = self.triggers.lock().await;
        let before = all.len();
        all.retain(|_, t| !t.is_expired(now));
        Ok(before - all.len())
    }
}

#[derive(Default)]
struct CredentialRows {
    next_id: i64,
    rows: Vec<Credential>,
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<CredentialRows>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever stored for a user, oldest first.
    #[cfg(test)]
    pub async fn history(&self, user_id: i32) -> Vec<Credential> {
        let inner = self.inner.lock().await;
        inner.rows.iter().filter(|c| c.user_id == user_id).cloned().collect()
    }
}

fn append_row(inner: &mut CredentialRows, new: NewCredential) -> Credential {
    inner.next_id += 1;
    let row = Credential {
        id: inner.next_id,
        user_id: new.user_id,
        access_token: new.access_token,
        refresh_token: new.refresh_token,
        access_expires_at: new.access_expires_at,
        refresh_expires_at: new.refresh_expires_at,
        token_type: new.token_type,
        scope: new.scope,
        created_at: Utc::now(),
    };
    inner.rows.push(row.clone());
    row
}

fn latest_of(inner: &CredentialRows, user_id: i32) -> Option<&Credential> {
    inner
        .rows
        .iter()
        .filter(|c| c.user_id == user_id)
        .max_by_key(|c| c.id)
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn latest(&self, user_id: i32) -> Result<Option<Credential>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(latest_of(&inner, user_id).cloned())
    }

    async fn rotate_latest(
        &self,
        user_id: i32,
        rotation: Rotation,
    ) -> Result<Credential, CredentialError> {
        // held across the rotation, like the row lock in Postgres
        let mut inner = self.inner.lock().await;
        let current = latest_of(&inner, user_id)
            .cloned()
            .ok_or(CredentialError::NotConnected(user_id))?;
        match rotation(current.clone()).await? {
            Some(next) => Ok(append_row(&mut inner, next)),
            None => Ok(current),
        }
    }

    async fn insert(&self, credential: NewCredential) -> Result<Credential, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(append_row(&mut inner, credential))
    }

    async fn delete_for_user(&self, user_id: i32) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner.rows.retain(|c| c.user_id != user_id);
        Ok(before - inner.rows.len())
    }

    async fn users_with_credentials(&self) -> Result<Vec<i32>, StoreError> {
        let inner = self.inner.lock().await;
        let mut users: Vec<i32> = inner.rows.iter().map(|c| c.user_id).collect();
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }
}

#[derive(Default)]
pub struct MemoryExecutionHistory {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionHistoryStore for MemoryExecutionHistory {
    async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn last_success(&self, trigger_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.trigger_id == trigger_id && r.status == ExecutionStatus::Success)
            .map(|r| r.executed_at)
            .max())
    }

    async fn list_for_trigger(
        &self,
        trigger_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut matching: Vec<ExecutionRecord> = records
            .iter()
            .filter(|r| r.trigger_id == trigger_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, ReconciliationMode, WeekdaySet};
    use crate::store::RotationFuture;
    use chrono::{Duration, NaiveTime};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn make_trigger(group_id: Uuid, kind: EventKind) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            group_id,
            user_id: 1,
            site_id: "site-1".to_string(),
            name: "Weekday peak".to_string(),
            description: None,
            weekdays: WeekdaySet::weekdays(),
            timezone: "UTC".to_string(),
            enabled: true,
            event_kind: kind,
            time_of_day: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            target_percent: 20,
            recurrence: "0 0 14 * * MON,TUE,WED,THU,FRI".to_string(),
            valid_from: None,
            valid_to: None,
            mode: ReconciliationMode::Continuous,
            created_at: Utc::now(),
        }
    }

    fn make_credential(user_id: i32, token: &str) -> NewCredential {
        let now = Utc::now();
        NewCredential {
            user_id,
            access_token: token.to_string(),
            refresh_token: format!("{}-refresh", token),
            access_expires_at: now + Duration::hours(8),
            refresh_expires_at: now + Duration::days(90),
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_replace_group_swaps_all_members() {
        let store = MemoryTriggerStore::new();
        let group = Uuid::new_v4();
        let old = vec![
            make_trigger(group, EventKind::StartDischarge),
            make_trigger(group, EventKind::StartCharge),
        ];
        let old_ids: Vec<Uuid> = old.iter().map(|t| t.id).collect();
        store.replace_group(group, old).await.unwrap();

        let new = vec![
            make_trigger(group, EventKind::StartDischarge),
            make_trigger(group, EventKind::StartCharge),
        ];
        store.replace_group(group, new).await.unwrap();

        let current = store.find_group(group).await.unwrap();
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|t| !old_ids.contains(&t.id)));
    }

    #[tokio::test]
    async fn test_replace_group_rejects_foreign_member() {
        let store = MemoryTriggerStore::new();
        let group = Uuid::new_v4();
        let result = store
            .replace_group(group, vec![make_trigger(Uuid::new_v4(), EventKind::StartCharge)])
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.find_group(group).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_group_enabled_applies_to_both() {
        let store = MemoryTriggerStore::new();
        let group = Uuid::new_v4();
        store
            .replace_group(
                group,
                vec![
                    make_trigger(group, EventKind::StartDischarge),
                    make_trigger(group, EventKind::StartCharge),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.set_group_enabled(group, false).await.unwrap(), 2);
        assert!(store.list_enabled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_override_requires_existing_group() {
        let store = MemoryTriggerStore::new();
        let result = store
            .insert_override(make_trigger(Uuid::new_v4(), EventKind::StartCharge))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_expired_only_touches_overrides() {
        let store = MemoryTriggerStore::new();
        let group = Uuid::new_v4();
        store
            .replace_group(group, vec![make_trigger(group, EventKind::StartCharge)])
            .await
            .unwrap();
        let mut transient = make_trigger(group, EventKind::StartCharge);
        transient.valid_from = Some(Utc::now() - Duration::hours(3));
        transient.valid_to = Some(Utc::now() - Duration::hours(1));
        store.insert_override(transient).await.unwrap();

        assert_eq!(store.delete_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.find_group(group).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotate_latest_appends_or_keeps_current() {
        let store = MemoryCredentialStore::new();
        let first = store.insert(make_credential(1, "a")).await.unwrap();

        let kept = store
            .rotate_latest(1, Box::new(|_current: Credential| -> RotationFuture { Box::pin(async { Ok(None) }) }))
            .await
            .unwrap();
        assert_eq!(kept, first);

        let rotated = store
            .rotate_latest(
                1,
                Box::new(|current: Credential| -> RotationFuture {
                    Box::pin(async move {
                        assert_eq!(current.access_token, "a");
                        Ok(Some(make_credential(1, "b")))
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(rotated.access_token, "b");
        assert_eq!(store.latest(1).await.unwrap().unwrap(), rotated);
        assert_eq!(store.history(1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_rotate_latest_failure_persists_nothing() {
        let store = MemoryCredentialStore::new();
        store.insert(make_credential(1, "a")).await.unwrap();

        let result = store
            .rotate_latest(
                1,
                Box::new(|_current: Credential| -> RotationFuture {
                    Box::pin(async { Err(CredentialError::TransientRefresh("reset".to_string())) })
                }),
            )
            .await;

        assert!(matches!(result, Err(CredentialError::TransientRefresh(_))));
        assert_eq!(store.history(1).await.len(), 1);
        let missing = store
            .rotate_latest(2, Box::new(|_current: Credential| -> RotationFuture { Box::pin(async { Ok(None) }) }))
            .await;
        assert!(matches!(missing, Err(CredentialError::NotConnected(2))));
    }

    #[tokio::test]
    async fn test_rotations_of_one_user_are_serialized() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.insert(make_credential(1, "a")).await.unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let store = store.clone();
                let in_flight = in_flight.clone();
                let overlapped = overlapped.clone();
                tokio::spawn(async move {
                    let rotation: Rotation = Box::new(move |_current: Credential| -> RotationFuture {
                        Box::pin(async move {
                            if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlapped.fetch_add(1, Ordering::SeqCst);
                            }
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(Some(make_credential(1, &format!("t{}", i))))
                        })
                    });
                    store.rotate_latest(1, rotation).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
        assert_eq!(store.history(1).await.len(), 4);
    }

    #[tokio::test]
    async fn test_users_with_credentials_deduplicates() {
        let store = MemoryCredentialStore::new();
        store.insert(make_credential(2, "x")).await.unwrap();
        store.insert(make_credential(1, "y")).await.unwrap();
        store.insert(make_credential(2, "z")).await.unwrap();

        assert_eq!(store.users_with_credentials().await.unwrap(), vec![1, 2]);
        assert_eq!(store.delete_for_user(2).await.unwrap(), 2);
        assert!(store.latest(2).await.unwrap().is_none());
    }
}

use super::{AuditSink, CredentialStore, ExecutionHistoryStore, Rotation, TriggerStore};
use crate::db::DbPool;
use crate::error::{CredentialError, StoreError};
use crate::models::{
    AuditEvent, Credential, EventKind, ExecutionRecord, ExecutionStatus, ExecutionType, NewCredential,
    ReconciliationMode, Trigger, WeekdaySet,
};
use crate::schema::{audit_events, credentials, execution_history, triggers};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use uuid::Uuid;

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = triggers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TriggerRow {
    id: Uuid,
    group_id: Uuid,
    user_id: i32,
    site_id: String,
    name: String,
    description: Option<String>,
    weekdays: String,
    timezone: String,
    enabled: bool,
    event_kind: String,
    time_of_day: NaiveTime,
    target_percent: i32,
    recurrence: String,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    reconciliation_mode: String,
    created_at: DateTime<Utc>,
}

impl From<&Trigger> for TriggerRow {
    fn from(t: &Trigger) -> Self {
        Self {
            id: t.id,
            group_id: t.group_id,
            user_id: t.user_id,
            site_id: t.site_id.clone(),
            name: t.name.clone(),
            description: t.description.clone(),
            weekdays: t.weekdays.to_cron(),
            timezone: t.timezone.clone(),
            enabled: t.enabled,
            event_kind: t.event_kind.as_str().to_string(),
            time_of_day: t.time_of_day,
            target_percent: t.target_percent,
            recurrence: t.recurrence.clone(),
            valid_from: t.valid_from,
            valid_to: t.valid_to,
            reconciliation_mode: t.mode.as_str().to_string(),
            created_at: t.created_at,
        }
    }
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = StoreError;

    fn try_from(row: TriggerRow) -> Result<Self, Self::Error> {
        let weekdays = row
            .weekdays
            .parse::<WeekdaySet>()
            .map_err(|e| StoreError::InvalidRow(format!("trigger {}: {}", row.id, e)))?;
        let event_kind = row
            .event_kind
            .parse::<EventKind>()
            .map_err(|e| StoreError::InvalidRow(format!("trigger {}: {}", row.id, e)))?;
        Ok(Trigger {
            id: row.id,
            group_id: row.group_id,
            user_id: row.user_id,
            site_id: row.site_id,
            name: row.name,
            description: row.description,
            weekdays,
            timezone: row.timezone,
            enabled: row.enabled,
            event_kind,
            time_of_day: row.time_of_day,
            target_percent: row.target_percent,
            recurrence: row.recurrence,
            valid_from: row.valid_from,
            valid_to: row.valid_to,
            mode: ReconciliationMode::from_db(&row.reconciliation_mode),
            created_at: row.created_at,
        })
    }
}

fn into_triggers(rows: Vec<TriggerRow>) -> Result<Vec<Trigger>, StoreError> {
    rows.into_iter().map(Trigger::try_from).collect()
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = credentials)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct CredentialRow {
    id: i64,
    user_id: i32,
    access_token: String,
    refresh_token: String,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    token_type: String,
    scope: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Credential {
            id: row.id,
            user_id: row.user_id,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            access_expires_at: row.access_expires_at,
            refresh_expires_at: row.refresh_expires_at,
            token_type: row.token_type,
            scope: row.scope,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = credentials)]
struct NewCredentialRow {
    user_id: i32,
    access_token: String,
    refresh_token: String,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    token_type: String,
    scope: Option<String>,
}

impl From<NewCredential> for NewCredentialRow {
    fn from(c: NewCredential) -> Self {
        Self {
            user_id: c.user_id,
            access_token: c.access_token,
            refresh_token: c.refresh_token,
            access_expires_at: c.access_expires_at,
            refresh_expires_at: c.refresh_expires_at,
            token_type: c.token_type,
            scope: c.scope,
        }
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = execution_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ExecutionRow {
    trigger_id: Uuid,
    group_id: Uuid,
    user_id: i32,
    trigger_name: String,
    recurrence: String,
    scheduled_for: Option<DateTime<Utc>>,
    executed_at: DateTime<Utc>,
    status: String,
    execution_type: String,
    applied_percent: Option<i32>,
    details: String,
}

impl From<&ExecutionRecord> for ExecutionRow {
    fn from(r: &ExecutionRecord) -> Self {
        Self {
            trigger_id: r.trigger_id,
            group_id: r.group_id,
            user_id: r.user_id,
            trigger_name: r.trigger_name.clone(),
            recurrence: r.recurrence.clone(),
            scheduled_for: r.scheduled_for,
            executed_at: r.executed_at,
            status: r.status.as_str().to_string(),
            execution_type: r.execution_type.as_str().to_string(),
            applied_percent: r.applied_percent,
            details: r.details.clone(),
        }
    }
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(ExecutionRecord {
            status: row.status.parse::<ExecutionStatus>().map_err(StoreError::InvalidRow)?,
            execution_type: row.execution_type.parse::<ExecutionType>().map_err(StoreError::InvalidRow)?,
            trigger_id: row.trigger_id,
            group_id: row.group_id,
            user_id: row.user_id,
            trigger_name: row.trigger_name,
            recurrence: row.recurrence,
            scheduled_for: row.scheduled_for,
            executed_at: row.executed_at,
            applied_percent: row.applied_percent,
            details: row.details,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = audit_events)]
struct NewAuditRow<'a> {
    user_id: i32,
    site_id: Option<&'a str>,
    event_kind: &'a str,
    occurred_at: DateTime<Utc>,
    detail: &'a str,
}

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Runs blocking diesel work off the async executor.
    async fn run<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
            work(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Pool(format!("database task failed: {}", e)))?
    }
}

#[async_trait]
impl TriggerStore for PgStore {
    async fn replace_group(&self, group_id: Uuid, new: Vec<Trigger>) -> Result<(), StoreError> {
        if let Some(stray) = new.iter().find(|t| t.group_id != group_id) {
            return Err(StoreError::Conflict(format!(
                "trigger {} does not belong to group {}",
                stray.id, group_id
            )));
        }
        let rows: Vec<TriggerRow> = new.iter().map(TriggerRow::from).collect();
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                diesel::delete(triggers::table.filter(triggers::group_id.eq(group_id)))
                    .execute(conn)?;
                diesel::insert_into(triggers::table)
                    .values(&rows)
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_group(&self, group_id: Uuid) -> Result<usize, StoreError> {
        self.run(move |conn| {
            Ok(diesel::delete(triggers::table.filter(triggers::group_id.eq(group_id)))
                .execute(conn)?)
        })
        .await
    }

    async fn set_group_enabled(&self, group_id: Uuid, enabled: bool) -> Result<usize, StoreError> {
        self.run(move |conn| {
            Ok(diesel::update(triggers::table.filter(triggers::group_id.eq(group_id)))
                .set(triggers::enabled.eq(enabled))
                .execute(conn)?)
        })
        .await
    }

    async fn find(&self, id: Uuid) -> Result<Option<Trigger>, StoreError> {
        self.run(move |conn| {
            triggers::table
                .find(id)
                .select(TriggerRow::as_select())
                .first::<TriggerRow>(conn)
                .optional()?
                .map(Trigger::try_from)
                .transpose()
        })
        .await
    }

    async fn find_group(&self, group_id: Uuid) -> Result<Vec<Trigger>, StoreError> {
        self.run(move |conn| {
            let rows = triggers::table
                .filter(triggers::group_id.eq(group_id))
                .order(triggers::time_of_day.asc())
                .select(TriggerRow::as_select())
                .load(conn)?;
            let mut group = into_triggers(rows)?;
            group.sort_by_key(|t| t.is_override());
            Ok(group)
        })
        .await
    }

    async fn list_enabled(&self) -> Result<Vec<Trigger>, StoreError> {
        self.run(|conn| {
            let rows = triggers::table
                .filter(triggers::enabled.eq(true))
                .select(TriggerRow::as_select())
                .load(conn)?;
            into_triggers(rows)
        })
        .await
    }

    async fn list_for_user(&self, user_id: i32) -> Result<Vec<Trigger>, StoreError> {
        self.run(move |conn| {
            let rows = triggers::table
                .filter(triggers::user_id.eq(user_id))
                .order(triggers::created_at.asc())
                .select(TriggerRow::as_select())
                .load(conn)?;
            into_triggers(rows)
        })
        .await
    }

    async fn insert_override(&self, trigger: Trigger) -> Result<(), StoreError> {
        let row = TriggerRow::from(&trigger);
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let members: i64 = triggers::table
                    .filter(triggers::group_id.eq(row.group_id))
                    .count()
                    .get_result(conn)?;
                if members == 0 {
                    return Err(StoreError::NotFound(format!("trigger group {}", row.group_id)));
                }
                diesel::insert_into(triggers::table).values(&row).execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.run(move |conn| {
            Ok(diesel::delete(triggers::table.filter(triggers::valid_to.lt(now))).execute(conn)?)
        })
        .await
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn latest(&self, user_id: i32) -> Result<Option<Credential>, StoreError> {
        self.run(move |conn| {
            let row = credentials::table
                .filter(credentials::user_id.eq(user_id))
                .order(credentials::id.desc())
                .select(CredentialRow::as_select())
                .first::<CredentialRow>(conn)
                .optional()?;
            Ok(row.map(Credential::from))
        })
        .await
    }

    async fn rotate_latest(
        &self,
        user_id: i32,
        rotation: Rotation,
    ) -> Result<Credential, CredentialError> {
        let pool = self.pool.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || -> Result<Credential, CredentialError> {
            let mut conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
            conn.transaction::<_, CredentialError, _>(|conn| {
                // SELECT ... FOR UPDATE on the user's newest row, held until commit
                let current = credentials::table
                    .filter(credentials::user_id.eq(user_id))
                    .order(credentials::id.desc())
                    .limit(1)
                    .select(CredentialRow::as_select())
                    .for_update()
                    .load::<CredentialRow>(conn)?
                    .into_iter()
                    .next()
                    .map(Credential::from)
                    .ok_or(CredentialError::NotConnected(user_id))?;

                let Some(next) = runtime.block_on(rotation(current.clone()))? else {
                    return Ok(current);
                };
                let saved: CredentialRow = diesel::insert_into(credentials::table)
                    .values(&NewCredentialRow::from(next))
                    .returning(CredentialRow::as_returning())
                    .get_result(conn)?;
                Ok(Credential::from(saved))
            })
        })
        .await
        .map_err(|e| StoreError::Pool(format!("database task failed: {}", e)))?
    }

    async fn insert(&self, credential: NewCredential) -> Result<Credential, StoreError> {
        let row = NewCredentialRow::from(credential);
        self.run(move |conn| {
            let saved: CredentialRow = diesel::insert_into(credentials::table)
                .values(&row)
                .returning(CredentialRow::as_returning())
                .get_result(conn)?;
            Ok(Credential::from(saved))
        })
        .await
    }

    async fn delete_for_user(&self, user_id: i32) -> Result<usize, StoreError> {
        self.run(move |conn| {
            Ok(diesel::delete(credentials::table.filter(credentials::user_id.eq(user_id)))
                .execute(conn)?)
        })
        .await
    }

    async fn users_with_credentials(&self) -> Result<Vec<i32>, StoreError> {
        self.run(|conn| {
            Ok(credentials::table
                .select(credentials::user_id)
                .distinct()
                .order(credentials::user_id.asc())
                .load(conn)?)
        })
        .await
    }
}

#[async_trait]
impl ExecutionHistoryStore for PgStore {
    async fn record(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let row = ExecutionRow::from(&record);
        self.run(move |conn| {
            diesel::insert_into(execution_history::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn last_success(&self, trigger_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.run(move |conn| {
            Ok(execution_history::table
                .filter(execution_history::trigger_id.eq(trigger_id))
                .filter(execution_history::status.eq(ExecutionStatus::Success.as_str()))
                .select(diesel::dsl::max(execution_history::executed_at))
                .first(conn)?)
        })
        .await
    }

    async fn list_for_trigger(
        &self,
        trigger_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let rows: Vec<ExecutionRow> = execution_history::table
                .filter(execution_history::trigger_id.eq(trigger_id))
                .order(execution_history::executed_at.desc())
                .limit(limit)
                .select(ExecutionRow::as_select())
                .load(conn)?;
            rows.into_iter().map(ExecutionRecord::try_from).collect()
        })
        .await
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.run(move |conn| {
            diesel::insert_into(audit_events::table)
                .values(NewAuditRow {
                    user_id: event.user_id,
                    site_id: event.site_id.as_deref(),
                    event_kind: event.kind.as_str(),
                    occurred_at: event.occurred_at,
                    detail: &event.detail,
                })
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}

use crate::error::{CredentialError, DeviceError, GuardedCallError, RefreshError, StoreError};
use crate::integrations::TokenRefresher;
use crate::models::{AuditEvent, AuditEventKind, Credential, NewCredential, TokenGrant};
use crate::store::{AuditSink, CredentialStore, Rotation, RotationFuture};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CredentialSettings {
    /// Refresh when the access token expires within this window.
    pub refresh_threshold: Duration,
    /// Longest a caller waits for another caller's refresh of the same user.
    pub lock_wait: Duration,
    /// Assumed refresh-token validity when the grant doesn't state one.
    pub refresh_token_lifetime: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(3600),
            lock_wait: Duration::from_secs(30),
            refresh_token_lifetime: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RefreshPolicy {
    /// Only when inside the expiry threshold.
    IfExpiring,
    /// Only if the current access token is still the one the Device API rejected.
    IfRejected(String),
}

impl RefreshPolicy {
    fn needs_refresh(&self, current: &Credential, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        let expiring = current.access_expires_at - now <= threshold;
        match self {
            RefreshPolicy::IfExpiring => expiring,
            RefreshPolicy::IfRejected(token) => current.access_token == *token || expiring,
        }
    }
}

/// Keeps one valid Device API credential per user.
pub struct CredentialLifecycleManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    audit: Arc<dyn AuditSink>,
    settings: CredentialSettings,
    user_locks: Mutex<HashMap<i32, Arc<Mutex<()>>>>,
}

impl CredentialLifecycleManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        audit: Arc<dyn AuditSink>,
        settings: CredentialSettings,
    ) -> Self {
        Self {
            store,
            refresher,
            audit,
            settings,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns an access token that is valid beyond the refresh threshold,
    /// refreshing it first if needed.
    pub async fn get_valid_access_token(&self, user_id: i32) -> Result<String, CredentialError> {
        let credential = self.refresh_under_lock(user_id, RefreshPolicy::IfExpiring).await?;
        Ok(credential.access_token)
    }

    /// Recovers from a Device API auth rejection: refreshes once (unless a
    /// concurrent caller already replaced `rejected_token`) and retries
    /// `operation` once. A second auth failure is returned as is.
    pub async fn handle_unauthorized<T, F, Fut>(
        &self,
        user_id: i32,
        rejected_token: &str,
        operation: F,
    ) -> Result<T, GuardedCallError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        warn!(
            "Device API rejected the access token of user {}, refreshing before one retry",
            user_id
        );
        let credential = self
            .refresh_under_lock(user_id, RefreshPolicy::IfRejected(rejected_token.to_string()))
            .await?;

        match operation(credential.access_token).await {
            Err(e) if e.is_auth() => {
                error!(
                    "Device API rejected the refreshed token of user {}, giving up",
                    user_id
                );
                Err(e.into())
            }
            other => other.map_err(GuardedCallError::from),
        }
    }

    /// Stores the first token pair of a newly linked account.
    pub async fn connect(&self, user_id: i32, grant: TokenGrant) -> Result<(), CredentialError> {
        let credential = NewCredential::from_grant(user_id, grant, Utc::now(), self.refresh_lifetime())
            .map_err(|e| CredentialError::InvalidGrant(e.to_string()))?;
        self.store.insert(credential).await?;
        info!("User {} connected their energy account", user_id);
        self.record_audit(user_id, AuditEventKind::Connect, "account connected").await;
        Ok(())
    }

    /// Forgets every credential of the user.
    pub async fn disconnect(&self, user_id: i32) -> Result<(), CredentialError> {
        let lock = self.user_lock(user_id).await;
        let _guard = self.acquire(user_id, &lock).await?;
        let removed = self.store.delete_for_user(user_id).await?;
        info!("User {} disconnected ({} credential rows removed)", user_id, removed);
        self.record_audit(user_id, AuditEventKind::Disconnect, "account disconnected").await;
        Ok(())
    }

    /// Connection-status flag: the latest access token is still valid.
    pub async fn is_connected(&self, user_id: i32) -> Result<bool, CredentialError> {
        let latest = self.store.latest(user_id).await?;
        Ok(latest.is_some_and(|c| c.access_valid_at(Utc::now())))
    }

    /// Proactive sweep over every user with a credential. Returns how many
    /// users ended with a valid token.
    pub async fn refresh_all(&self) -> Result<usize, StoreError> {
        let users = self.store.users_with_credentials().await?;
        let mut healthy = 0;
        for user_id in users {
            match self.get_valid_access_token(user_id).await {
                Ok(_) => healthy += 1,
                Err(CredentialError::ReauthenticationRequired(_)) => {
                    warn!("User {} must reconnect their account", user_id);
                }
                Err(e) => error!("Proactive token refresh failed for user {}: {}", user_id, e),
            }
        }
        Ok(healthy)
    }

    fn refresh_lifetime(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.refresh_token_lifetime)
            .unwrap_or_else(|_| chrono::Duration::days(90))
    }

    async fn user_lock(&self, user_id: i32) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user_id).or_default().clone()
    }

    async fn acquire<'a>(
        &self,
        user_id: i32,
        lock: &'a Mutex<()>,
    ) -> Result<tokio::sync::MutexGuard<'a, ()>, CredentialError> {
        tokio::time::timeout(self.settings.lock_wait, lock.lock())
            .await
            .map_err(|_| {
                warn!("Timed out waiting for the credential lock of user {}", user_id);
                CredentialError::LockTimeout(user_id)
            })
    }

    /// Read-latest, refresh-if-needed, persist, all under the store's lock on
    /// the user's credential row so a refresh token is presented at most once
    /// across processes. The in-process lock bounds how long local callers
    /// queue. Both are released before the caller touches the Device API.
    async fn refresh_under_lock(
        &self,
        user_id: i32,
        policy: RefreshPolicy,
    ) -> Result<Credential, CredentialError> {
        let lock = self.user_lock(user_id).await;
        let _guard = self.acquire(user_id, &lock).await?;

        let refresher = self.refresher.clone();
        let threshold = chrono::Duration::from_std(self.settings.refresh_threshold)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let refresh_lifetime = self.refresh_lifetime();
        let rotation: Rotation = Box::new(move |current: Credential| -> RotationFuture {
            Box::pin(async move {
                let now = Utc::now();
                if !policy.needs_refresh(&current, now, threshold) {
                    return Ok(None);
                }
                refresh(refresher.as_ref(), current, now, refresh_lifetime)
                    .await
                    .map(Some)
            })
        });

        match self.store.rotate_latest(user_id, rotation).await {
            Err(CredentialError::ReauthenticationRequired(_)) => {
                self.record_audit(
                    user_id,
                    AuditEventKind::Disconnect,
                    "user must reconnect their account",
                )
                .await;
                Err(CredentialError::ReauthenticationRequired(user_id))
            }
            Err(CredentialError::Store(e)) => {
                error!("Failed to persist refreshed credential for user {}: {}", user_id, e);
                Err(CredentialError::Store(e))
            }
            other => other,
        }
    }

    async fn record_audit(&self, user_id: i32, kind: AuditEventKind, detail: &str) {
        if let Err(e) = self
            .audit
            .append(AuditEvent::new(user_id, None, kind, detail))
            .await
        {
            error!("Failed to append {} audit event: {}", kind.as_str(), e);
        }
    }
}

/// Exchanges the consumed refresh token of `current` for its replacement.
async fn refresh(
    refresher: &dyn TokenRefresher,
    current: Credential,
    now: DateTime<Utc>,
    refresh_lifetime: chrono::Duration,
) -> Result<NewCredential, CredentialError> {
    let user_id = current.user_id;
    if !current.refresh_valid_at(now) {
        warn!("User {} must reconnect: refresh token expired", user_id);
        return Err(CredentialError::ReauthenticationRequired(user_id));
    }

    let grant = match refresher.refresh(&current.refresh_token).await {
        Ok(grant) => grant,
        Err(RefreshError::Rejected(reason)) => {
            warn!("User {} must reconnect: {}", user_id, reason);
            return Err(CredentialError::ReauthenticationRequired(user_id));
        }
        Err(RefreshError::Transport(reason)) => {
            warn!("Token refresh for user {} failed transiently: {}", user_id, reason);
            return Err(CredentialError::TransientRefresh(reason));
        }
    };

    let next = NewCredential::from_grant(user_id, grant, now, refresh_lifetime).map_err(|e| {
        error!("Token endpoint returned an unusable grant for user {}: {}", user_id, e);
        CredentialError::TransientRefresh(e.to_string())
    })?;
    info!(
        "Refreshed access token for user {} (valid until {})",
        user_id, next.access_expires_at
    );
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAuditSink, MemoryCredentialStore};
    use crate::test_support::{credential, CountingRefresher};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<MemoryCredentialStore>,
        refresher: Arc<CountingRefresher>,
        audit: Arc<MemoryAuditSink>,
        manager: Arc<CredentialLifecycleManager>,
    }

    fn fixture(refresher: CountingRefresher) -> Fixture {
        let store = Arc::new(MemoryCredentialStore::new());
        let refresher = Arc::new(refresher);
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = Arc::new(CredentialLifecycleManager::new(
            store.clone(),
            refresher.clone(),
            audit.clone(),
            CredentialSettings::default(),
        ));
        Fixture {
            store,
            refresher,
            audit,
            manager,
        }
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let f = fixture(CountingRefresher::new());
        f.store
            .insert(credential(1, "fresh", chrono::Duration::hours(8)))
            .await
            .unwrap();

        let token = f.manager.get_valid_access_token(1).await.unwrap();

        assert_eq!(token, "fresh");
        assert_eq!(f.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_history_kept() {
        let f = fixture(CountingRefresher::new());
        f.store
            .insert(credential(1, "old", chrono::Duration::minutes(10)))
            .await
            .unwrap();

        let token = f.manager.get_valid_access_token(1).await.unwrap();

        assert_eq!(token, "token-1");
        assert_eq!(f.refresher.calls(), 1);
        let history = f.store.history(1).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let mut refresher = CountingRefresher::new();
        refresher.delay = Duration::from_millis(50);
        let f = fixture(refresher);
        f.store
            .insert(credential(1, "old", chrono::Duration::minutes(1)))
            .await
            .unwrap();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = f.manager.clone();
                tokio::spawn(async move { manager.get_valid_access_token(1).await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(f.refresher.calls(), 1);
        assert!(tokens.iter().all(|t| t == "token-1"));
        // the consumed refresh token was presented exactly once
        assert_eq!(f.refresher.consumed.lock().unwrap().as_slice(), ["old-refresh"]);
    }

    #[tokio::test]
    async fn test_refresh_for_different_users_is_independent() {
        let f = fixture(CountingRefresher::new());
        for user in [1, 2] {
            f.store
                .insert(credential(user, &format!("u{}", user), chrono::Duration::minutes(1)))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            f.manager.get_valid_access_token(1),
            f.manager.get_valid_access_token(2)
        );

        assert!(a.is_ok() && b.is_ok());
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(f.refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_refresh_token_requires_reauthentication() {
        let f = fixture(CountingRefresher::new());
        let mut cred = credential(1, "old", chrono::Duration::minutes(-5));
        cred.refresh_expires_at = Utc::now() - chrono::Duration::days(1);
        f.store.insert(cred).await.unwrap();

        let err = f.manager.get_valid_access_token(1).await.unwrap_err();

        assert!(matches!(err, CredentialError::ReauthenticationRequired(1)));
        assert_eq!(f.refresher.calls(), 0);
        let events = f.audit.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditEventKind::Disconnect);
        assert!(events[0].detail.contains("reconnect"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_requires_reauthentication() {
        let mut refresher = CountingRefresher::new();
        refresher.failure = Some(RefreshError::Rejected("invalid_grant".to_string()));
        let f = fixture(refresher);
        f.store
            .insert(credential(1, "old", chrono::Duration::minutes(1)))
            .await
            .unwrap();

        let err = f.manager.get_valid_access_token(1).await.unwrap_err();
        assert!(matches!(err, CredentialError::ReauthenticationRequired(1)));
    }

    #[tokio::test]
    async fn test_network_failure_is_transient_and_not_retried() {
        let mut refresher = CountingRefresher::new();
        refresher.failure = Some(RefreshError::Transport("connection reset".to_string()));
        let f = fixture(refresher);
        f.store
            .insert(credential(1, "old", chrono::Duration::minutes(1)))
            .await
            .unwrap();

        let err = f.manager.get_valid_access_token(1).await.unwrap_err();

        assert!(matches!(err, CredentialError::TransientRefresh(_)));
        assert!(err.is_transient());
        assert_eq!(f.refresher.calls(), 1);
        // nothing was persisted
        assert_eq!(f.store.history(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let f = fixture(CountingRefresher::new());
        let err = f.manager.get_valid_access_token(9).await.unwrap_err();
        assert!(matches!(err, CredentialError::NotConnected(9)));
    }

    #[tokio::test]
    async fn test_handle_unauthorized_refreshes_once_and_retries_once() {
        let f = fixture(CountingRefresher::new());
        f.store
            .insert(credential(1, "revoked", chrono::Duration::hours(8)))
            .await
            .unwrap();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = f
            .manager
            .handle_unauthorized(1, "revoked", |token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(token, "token-1");
                    Err(DeviceError::Unauthorized)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(GuardedCallError::Device(DeviceError::Unauthorized))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(f.refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_managers_sharing_a_store_present_refresh_token_once() {
        let mut refresher = CountingRefresher::new();
        refresher.delay = Duration::from_millis(50);
        let refresher = Arc::new(refresher);
        let store = Arc::new(MemoryCredentialStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        store
            .insert(credential(1, "old", chrono::Duration::minutes(1)))
            .await
            .unwrap();
        // one manager per process, each with its own in-process lock
        let manager = || {
            CredentialLifecycleManager::new(
                store.clone(),
                refresher.clone(),
                audit.clone(),
                CredentialSettings::default(),
            )
        };
        let (a, b) = (manager(), manager());

        let (first, second) = tokio::join!(a.get_valid_access_token(1), b.get_valid_access_token(1));

        assert_eq!(first.unwrap(), "token-1");
        assert_eq!(second.unwrap(), "token-1");
        assert_eq!(refresher.calls(), 1);
        assert_eq!(refresher.consumed.lock().unwrap().as_slice(), ["old-refresh"]);
        assert!(audit.events().await.is_empty());
        assert_eq!(store.history(1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_handle_unauthorized_skips_refresh_if_token_already_replaced() {
        let f = fixture(CountingRefresher::new());
        f.store
            .insert(credential(1, "newer", chrono::Duration::hours(8)))
            .await
            .unwrap();

        let token = f
            .manager
            .handle_unauthorized(1, "stale", |token| async move { Ok::<_, DeviceError>(token) })
            .await
            .unwrap();

        assert_eq!(token, "newer");
        assert_eq!(f.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_lock_wait_is_bounded() {
        let mut refresher = CountingRefresher::new();
        refresher.delay = Duration::from_millis(300);
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .insert(credential(1, "old", chrono::Duration::minutes(1)))
            .await
            .unwrap();
        let manager = Arc::new(CredentialLifecycleManager::new(
            store,
            Arc::new(refresher),
            Arc::new(MemoryAuditSink::new()),
            CredentialSettings {
                lock_wait: Duration::from_millis(50),
                ..CredentialSettings::default()
            },
        ));

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_valid_access_token(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting = manager.get_valid_access_token(1).await;

        assert!(matches!(waiting, Err(CredentialError::LockTimeout(1))));
        assert_eq!(slow.await.unwrap().unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_connect_disconnect_and_status() {
        let f = fixture(CountingRefresher::new());
        assert!(!f.manager.is_connected(5).await.unwrap());

        let grant = TokenGrant {
            access_token: "first".to_string(),
            refresh_token: "first-refresh".to_string(),
            expires_in: 3600 * 8,
            refresh_expires_in: None,
            token_type: "Bearer".to_string(),
            scope: None,
        };
        f.manager.connect(5, grant).await.unwrap();
        assert!(f.manager.is_connected(5).await.unwrap());

        f.manager.disconnect(5).await.unwrap();
        assert!(!f.manager.is_connected(5).await.unwrap());

        let kinds: Vec<AuditEventKind> = f.audit.events().await.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditEventKind::Connect, AuditEventKind::Disconnect]);
    }

    #[tokio::test]
    async fn test_refresh_all_counts_healthy_users() {
        let f = fixture(CountingRefresher::new());
        f.store
            .insert(credential(1, "soon", chrono::Duration::minutes(5)))
            .await
            .unwrap();
        f.store
            .insert(credential(2, "fine", chrono::Duration::hours(8)))
            .await
            .unwrap();
        let mut dead = credential(3, "dead", chrono::Duration::minutes(-1));
        dead.refresh_expires_at = Utc::now() - chrono::Duration::minutes(1);
        f.store.insert(dead).await.unwrap();

        let healthy = f.manager.refresh_all().await.unwrap();

        assert_eq!(healthy, 2);
        assert_eq!(f.refresher.calls(), 1);
    }
}

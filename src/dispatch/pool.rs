//! Credential pool: health tracking and least-recently-used selection.
//!
//! Each credential moves between `healthy`, `rate_limited(until)` and
//! `disabled`. Every transition is written to the store so a restart
//! honours an in-progress rate limit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PoolError;
use crate::store::{CredentialHealth, CredentialStatus, Store};
use crate::transport::Session;

/// A credential handed out for one send attempt.
#[derive(Clone)]
pub struct Lease {
    pub credential_id: String,
    pub session: Arc<dyn Session>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("credential_id", &self.credential_id)
            .finish()
    }
}

struct Entry {
    health: CredentialHealth,
    /// None when the credential never connected.
    session: Option<Arc<dyn Session>>,
    last_used: Option<DateTime<Utc>>,
}

/// Pool of sending credentials, in declaration order.
pub struct CredentialPool {
    entries: Mutex<Vec<Entry>>,
    /// Serialises health writes to the store.
    write_lock: Mutex<()>,
    store: Arc<dyn Store>,
    max_auth_failures: u32,
    rate_limit_padding: Duration,
}

impl CredentialPool {
    pub fn new(store: Arc<dyn Store>, max_auth_failures: u32, rate_limit_padding_secs: u64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
            store,
            max_auth_failures: max_auth_failures.max(1),
            rate_limit_padding: Duration::from_secs(rate_limit_padding_secs),
        }
    }

    /// Register a credential, restoring its persisted health.
    pub async fn add(
        &self,
        credential_id: &str,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), PoolError> {
        let health = self
            .store
            .get_credential_health(credential_id)
            .await?
            .unwrap_or_else(|| CredentialHealth::healthy(credential_id));

        if health.status != CredentialStatus::Healthy {
            info!(
                credential = %credential_id,
                status = health.status.as_str(),
                "Restored credential health"
            );
        }

        let mut entries = self.entries.lock().await;
        match entries
            .iter_mut()
            .find(|e| e.health.credential_id == credential_id)
        {
            Some(existing) => {
                existing.session = session;
            }
            None => entries.push(Entry {
                health,
                session,
                last_used: None,
            }),
        }
        Ok(())
    }

    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        self.acquire_at(Utc::now()).await
    }

    /// Pick the least-recently-used usable credential as of `now`.
    pub async fn acquire_at(&self, now: DateTime<Utc>) -> Result<Lease, PoolError> {
        let mut recovered = Vec::new();
        let result = {
            let mut entries = self.entries.lock().await;

            // Rate limits that expired become healthy again.
            for entry in entries.iter_mut() {
                if let CredentialStatus::RateLimited { until } = entry.health.status {
                    if until <= now {
                        entry.health.status = CredentialStatus::Healthy;
                        entry.health.updated_at = now;
                        info!(credential = %entry.health.credential_id, "Credential recovered from rate limit");
                        recovered.push(entry.health.credential_id.clone());
                    }
                }
            }
            pick(&mut entries, now)
        };

        for credential_id in &recovered {
            if let Err(e) = self.persist(credential_id).await {
                warn!(credential = %credential_id, "Failed to persist credential health: {e}");
            }
        }
        result
    }

    pub async fn report_rate_limited(&self, credential_id: &str, wait: Duration) -> Result<(), PoolError> {
        self.report_rate_limited_at(credential_id, wait, Utc::now()).await
    }

    /// Mark a credential unusable until `now + wait + padding`.
    pub async fn report_rate_limited_at(
        &self,
        credential_id: &str,
        wait: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let total = wait + self.rate_limit_padding;
        let until = now
            + chrono::Duration::from_std(total).unwrap_or_else(|_| chrono::Duration::seconds(60));

        {
            let mut entries = self.entries.lock().await;
            let entry = find(&mut entries, credential_id)?;
            if entry.health.status == CredentialStatus::Disabled {
                return Ok(());
            }
            entry.health.status = CredentialStatus::RateLimited { until };
            entry.health.last_error = Some(format!("rate limited for {}s", total.as_secs()));
            entry.health.updated_at = now;
        }
        warn!(credential = %credential_id, until = %until, "Credential rate limited");
        self.persist(credential_id).await
    }

    /// Count an authentication failure; disable after the configured limit.
    pub async fn report_auth_failure(&self, credential_id: &str, reason: &str) -> Result<(), PoolError> {
        let failures = {
            let mut entries = self.entries.lock().await;
            let entry = find(&mut entries, credential_id)?;
            entry.health.consecutive_failures += 1;
            entry.health.last_error = Some(reason.to_string());
            entry.health.updated_at = Utc::now();
            if entry.health.consecutive_failures >= self.max_auth_failures {
                entry.health.status = CredentialStatus::Disabled;
            }
            entry.health.consecutive_failures
        };

        if failures >= self.max_auth_failures {
            warn!(credential = %credential_id, failures, "Credential disabled after repeated auth failures");
        } else {
            warn!(credential = %credential_id, failures, reason = %reason, "Credential auth failure");
        }
        self.persist(credential_id).await
    }

    /// A confirmed send resets the failure counter.
    pub async fn report_success(&self, credential_id: &str) -> Result<(), PoolError> {
        {
            let mut entries = self.entries.lock().await;
            let entry = find(&mut entries, credential_id)?;
            if entry.health.consecutive_failures == 0 && entry.health.last_error.is_none() {
                return Ok(());
            }
            entry.health.consecutive_failures = 0;
            entry.health.last_error = None;
            entry.health.updated_at = Utc::now();
        }
        self.persist(credential_id).await
    }

    /// Record a non-state-changing error for status reporting.
    pub async fn report_error(&self, credential_id: &str, error: &str) {
        let mut entries = self.entries.lock().await;
        if let Ok(entry) = find(&mut entries, credential_id) {
            entry.health.last_error = Some(error.to_string());
        }
    }

    /// Operator re-enable: back to healthy with a clean counter.
    pub async fn reset(&self, credential_id: &str) -> Result<(), PoolError> {
        {
            let mut entries = self.entries.lock().await;
            let entry = find(&mut entries, credential_id)?;
            entry.health = CredentialHealth::healthy(credential_id);
        }
        info!(credential = %credential_id, "Credential reset");
        self.persist(credential_id).await
    }

    /// Whether the credential has been disabled.
    pub async fn is_disabled(&self, credential_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .iter()
            .any(|e| e.health.credential_id == credential_id && e.health.status == CredentialStatus::Disabled)
    }

    /// Current health of every credential, in declaration order.
    pub async fn health(&self) -> Vec<CredentialHealth> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.health.clone())
            .collect()
    }

    /// Connected sessions in declaration order, regardless of health.
    pub async fn sessions(&self) -> Vec<Lease> {
        self.entries
            .lock()
            .await
            .iter()
            .filter_map(|e| {
                e.session.as_ref().map(|s| Lease {
                    credential_id: e.health.credential_id.clone(),
                    session: Arc::clone(s),
                })
            })
            .collect()
    }

    /// A connected, non-disabled session for lookups and history reads.
    pub async fn any_session(&self) -> Option<Arc<dyn Session>> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.health.status != CredentialStatus::Disabled)
            .find_map(|e| e.session.clone())
    }

    /// Write the credential's current health. Writes are serialised and carry
    /// the latest in-memory state; the entries lock is released before the
    /// store call.
    async fn persist(&self, credential_id: &str) -> Result<(), PoolError> {
        let _write = self.write_lock.lock().await;
        let health = {
            let mut entries = self.entries.lock().await;
            find(&mut entries, credential_id)?.health.clone()
        };
        self.store.set_credential_health(&health).await?;
        Ok(())
    }
}

/// Least-recently-used healthy entry, or the earliest recovery time.
fn pick(entries: &mut [Entry], now: DateTime<Utc>) -> Result<Lease, PoolError> {
    let chosen = entries
        .iter_mut()
        .enumerate()
        .filter(|(_, e)| e.session.is_some() && e.health.status == CredentialStatus::Healthy)
        // None sorts before Some, so never-used credentials go first.
        .min_by_key(|(order, e)| (e.last_used, *order))
        .map(|(_, e)| e);

    if let Some(entry) = chosen {
        if let Some(ref session) = entry.session {
            entry.last_used = Some(now);
            return Ok(Lease {
                credential_id: entry.health.credential_id.clone(),
                session: Arc::clone(session),
            });
        }
    }

    let retry_at = entries
        .iter()
        .filter(|e| e.session.is_some())
        .filter_map(|e| match e.health.status {
            CredentialStatus::RateLimited { until } => Some(until),
            _ => None,
        })
        .min();

    Err(PoolError::NoneAvailable { retry_at })
}

fn find<'a>(entries: &'a mut [Entry], credential_id: &str) -> Result<&'a mut Entry, PoolError> {
    entries
        .iter_mut()
        .find(|e| e.health.credential_id == credential_id)
        .ok_or_else(|| PoolError::UnknownCredential(credential_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::{DatabaseError, SendError, TransportError};
    use crate::pipeline::types::{DeliveryMode, DeliveryReceipt, Destination, Message, OutboundPayload};
    use crate::store::{Checkpoint, LibSqlBackend, LinkRecord, LinkStatus};
    use crate::transport::MessageStream;

    struct NullSession(String);

    #[async_trait]
    impl Session for NullSession {
        fn credential_id(&self) -> &str {
            &self.0
        }
        async fn receive(&self) -> Result<MessageStream, TransportError> {
            Err(TransportError::Unsupported("receive".into()))
        }
        async fn fetch_history(&self, _: i64, _: i64) -> Result<Vec<Message>, TransportError> {
            Ok(Vec::new())
        }
        async fn send(
            &self,
            _: Destination,
            _: &OutboundPayload,
            _: DeliveryMode,
        ) -> Result<DeliveryReceipt, SendError> {
            Ok(DeliveryReceipt {
                delivered_ids: vec![1],
            })
        }
        async fn resolve(&self, _: &str) -> Result<i64, TransportError> {
            Err(TransportError::NotFound("x".into()))
        }
    }

    /// Store whose health writes wait until `open` is notified.
    struct GatedStore {
        inner: LibSqlBackend,
        open: tokio::sync::Notify,
        waiting: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Store for GatedStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn get_checkpoint(&self, source_id: i64) -> Result<Option<i64>, DatabaseError> {
            self.inner.get_checkpoint(source_id).await
        }
        async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, DatabaseError> {
            self.inner.list_checkpoints().await
        }
        async fn commit_checkpoint(&self, source_id: i64, position: i64) -> Result<(), DatabaseError> {
            self.inner.commit_checkpoint(source_id, position).await
        }
        async fn has_processed(&self, source_id: i64, hash: &str) -> Result<bool, DatabaseError> {
            self.inner.has_processed(source_id, hash).await
        }
        async fn record_processed(&self, source_id: i64, hash: &str) -> Result<(), DatabaseError> {
            self.inner.record_processed(source_id, hash).await
        }
        async fn commit_delivery(&self, source_id: i64, position: i64, hash: &str) -> Result<(), DatabaseError> {
            self.inner.commit_delivery(source_id, position, hash).await
        }
        async fn prune_processed(&self, retention_days: u32) -> Result<usize, DatabaseError> {
            self.inner.prune_processed(retention_days).await
        }
        async fn get_credential_health(&self, id: &str) -> Result<Option<CredentialHealth>, DatabaseError> {
            self.inner.get_credential_health(id).await
        }
        async fn set_credential_health(&self, health: &CredentialHealth) -> Result<(), DatabaseError> {
            self.waiting.store(true, std::sync::atomic::Ordering::SeqCst);
            self.open.notified().await;
            self.inner.set_credential_health(health).await
        }
        async fn list_credential_health(&self) -> Result<Vec<CredentialHealth>, DatabaseError> {
            self.inner.list_credential_health().await
        }
        async fn upsert_link(&self, url: &str, target_id: i64, position: i64, text: Option<&str>) -> Result<(), DatabaseError> {
            self.inner.upsert_link(url, target_id, position, text).await
        }
        async fn links_to_check(&self, limit: usize) -> Result<Vec<LinkRecord>, DatabaseError> {
            self.inner.links_to_check(limit).await
        }
        async fn set_link_status(&self, url: &str, status: LinkStatus) -> Result<(), DatabaseError> {
            self.inner.set_link_status(url, status).await
        }
        async fn set_link_message_text(&self, target_id: i64, position: i64, text: &str) -> Result<(), DatabaseError> {
            self.inner.set_link_message_text(target_id, position, text).await
        }
        async fn get_link_scan_position(&self, target_id: i64) -> Result<Option<i64>, DatabaseError> {
            self.inner.get_link_scan_position(target_id).await
        }
        async fn set_link_scan_position(&self, target_id: i64, position: i64) -> Result<(), DatabaseError> {
            self.inner.set_link_scan_position(target_id, position).await
        }
    }

    fn session(id: &str) -> Option<Arc<dyn Session>> {
        Some(Arc::new(NullSession(id.to_string())))
    }

    async fn pool_with(ids: &[&str]) -> (CredentialPool, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = CredentialPool::new(Arc::clone(&store), 3, 0);
        for id in ids {
            pool.add(id, session(id)).await.unwrap();
        }
        (pool, store)
    }

    #[tokio::test]
    async fn least_recently_used_rotation() {
        let (pool, _) = pool_with(&["a", "b"]).await;
        let t0 = Utc::now();
        assert_eq!(pool.acquire_at(t0).await.unwrap().credential_id, "a");
        assert_eq!(
            pool.acquire_at(t0 + chrono::Duration::seconds(1)).await.unwrap().credential_id,
            "b"
        );
        assert_eq!(
            pool.acquire_at(t0 + chrono::Duration::seconds(2)).await.unwrap().credential_id,
            "a"
        );
    }

    #[tokio::test]
    async fn rate_limited_credential_skipped_until_expiry() {
        let (pool, _) = pool_with(&["a", "b"]).await;
        let t0 = Utc::now();
        pool.report_rate_limited_at("a", Duration::from_secs(60), t0)
            .await
            .unwrap();

        assert_eq!(pool.acquire_at(t0).await.unwrap().credential_id, "b");
        assert_eq!(
            pool.acquire_at(t0 + chrono::Duration::seconds(30)).await.unwrap().credential_id,
            "b"
        );

        let later = t0 + chrono::Duration::seconds(61);
        assert_eq!(pool.acquire_at(later).await.unwrap().credential_id, "a");
        let health = pool.health().await;
        assert_eq!(health[0].status, CredentialStatus::Healthy);
    }

    #[tokio::test]
    async fn none_available_reports_earliest_recovery() {
        let (pool, _) = pool_with(&["a", "b"]).await;
        let t0 = Utc::now();
        pool.report_rate_limited_at("a", Duration::from_secs(60), t0).await.unwrap();
        pool.report_rate_limited_at("b", Duration::from_secs(10), t0).await.unwrap();

        match pool.acquire_at(t0).await {
            Err(PoolError::NoneAvailable { retry_at: Some(at) }) => {
                assert_eq!(at, t0 + chrono::Duration::seconds(10));
            }
            other => panic!("expected NoneAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn padding_extends_rate_limit() {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = CredentialPool::new(store, 3, 5);
        pool.add("a", session("a")).await.unwrap();
        let t0 = Utc::now();
        pool.report_rate_limited_at("a", Duration::from_secs(10), t0).await.unwrap();
        assert!(pool.acquire_at(t0 + chrono::Duration::seconds(12)).await.is_err());
        assert!(pool.acquire_at(t0 + chrono::Duration::seconds(15)).await.is_ok());
    }

    #[tokio::test]
    async fn auth_failures_disable_and_success_resets() {
        let (pool, _) = pool_with(&["a"]).await;
        pool.report_auth_failure("a", "401").await.unwrap();
        pool.report_auth_failure("a", "401").await.unwrap();
        pool.report_success("a").await.unwrap();
        assert_eq!(pool.health().await[0].consecutive_failures, 0);

        for _ in 0..3 {
            pool.report_auth_failure("a", "401").await.unwrap();
        }
        assert_eq!(pool.health().await[0].status, CredentialStatus::Disabled);
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NoneAvailable { retry_at: None })
        ));

        pool.reset("a").await.unwrap();
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn health_survives_restart() {
        let (pool, store) = pool_with(&["a"]).await;
        let t0 = Utc::now();
        pool.report_rate_limited_at("a", Duration::from_secs(600), t0).await.unwrap();

        let restarted = CredentialPool::new(Arc::clone(&store), 3, 0);
        restarted.add("a", session("a")).await.unwrap();
        assert!(matches!(
            restarted.health().await[0].status,
            CredentialStatus::RateLimited { .. }
        ));
        assert!(restarted.acquire_at(t0).await.is_err());
    }

    #[tokio::test]
    async fn credentials_without_session_are_skipped() {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = CredentialPool::new(store, 3, 0);
        pool.add("offline", None).await.unwrap();
        pool.add("b", session("b")).await.unwrap();
        assert_eq!(pool.acquire().await.unwrap().credential_id, "b");
        assert_eq!(pool.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_credential_errors() {
        let (pool, _) = pool_with(&["a"]).await;
        assert!(matches!(
            pool.report_success("zzz").await,
            Err(PoolError::UnknownCredential(_))
        ));
    }

    #[tokio::test]
    async fn acquire_is_not_blocked_by_a_slow_health_write() {
        let store = Arc::new(GatedStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            open: tokio::sync::Notify::new(),
            waiting: std::sync::atomic::AtomicBool::new(false),
        });
        let pool = Arc::new(CredentialPool::new(store.clone(), 3, 0));
        pool.add("a", session("a")).await.unwrap();
        pool.add("b", session("b")).await.unwrap();

        let reporter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.report_rate_limited("a", Duration::from_secs(60)).await })
        };
        while !store.waiting.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        // The write is parked; the pool already reflects the rate limit.
        let lease = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("acquire waited on the store")
            .unwrap();
        assert_eq!(lease.credential_id, "b");

        store.open.notify_one();
        reporter.await.unwrap().unwrap();
        let persisted = store.inner.get_credential_health("a").await.unwrap().unwrap();
        assert!(matches!(persisted.status, CredentialStatus::RateLimited { .. }));
    }
}

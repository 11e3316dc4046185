//! libSQL backend: async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared; writes are serialized behind an async lock so a transaction
//! never interleaves with another task's statements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Checkpoint, CredentialHealth, CredentialStatus, LinkRecord, LinkStatus, Store,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Read the checkpoint for a source on any connection-like handle.
async fn read_checkpoint(conn: &Connection, source_id: i64) -> Result<Option<i64>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT position FROM checkpoints WHERE source_id = ?1",
            params![source_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_checkpoint: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let position: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("get_checkpoint: {e}")))?;
            Ok(Some(position))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_checkpoint: {e}"))),
    }
}

/// Monotonic upsert. Caller holds the write lock.
async fn write_checkpoint(
    conn: &Connection,
    source_id: i64,
    position: i64,
) -> Result<(), DatabaseError> {
    if let Some(current) = read_checkpoint(conn, source_id).await? {
        if position <= current {
            return Err(DatabaseError::StaleCheckpoint {
                source_id,
                current,
                attempted: position,
            });
        }
    }

    conn.execute(
        "INSERT INTO checkpoints (source_id, position, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (source_id) DO UPDATE SET position = ?2, updated_at = ?3",
        params![source_id, position, Utc::now().to_rfc3339()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("commit_checkpoint: {e}")))?;
    Ok(())
}

async fn insert_hash(conn: &Connection, source_id: i64, hash: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO processed_hashes (source_id, hash, recorded_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (source_id, hash) DO UPDATE SET recorded_at = ?3",
        params![source_id, hash, Utc::now().to_rfc3339()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("record_processed: {e}")))?;
    Ok(())
}

/// Map a row to CredentialHealth.
///
/// Column order: 0:credential_id, 1:status, 2:until, 3:consecutive_failures,
/// 4:last_error, 5:updated_at
fn row_to_health(row: &libsql::Row) -> Result<CredentialHealth, libsql::Error> {
    let credential_id: String = row.get(0)?;
    let status_str: String = row.get(1)?;
    let until: Option<String> = row.get(2).ok();
    let failures: i64 = row.get(3)?;
    let last_error: Option<String> = row.get(4).ok();
    let updated_str: String = row.get(5)?;

    let status = match (status_str.as_str(), until) {
        ("rate_limited", Some(until)) => CredentialStatus::RateLimited {
            until: parse_datetime(&until),
        },
        ("disabled", _) => CredentialStatus::Disabled,
        _ => CredentialStatus::Healthy,
    };

    Ok(CredentialHealth {
        credential_id,
        status,
        consecutive_failures: failures.max(0) as u32,
        last_error,
        updated_at: parse_datetime(&updated_str),
    })
}

const HEALTH_COLUMNS: &str =
    "credential_id, status, until, consecutive_failures, last_error, updated_at";

fn row_to_link(row: &libsql::Row) -> Result<LinkRecord, libsql::Error> {
    let last_checked: Option<String> = row.get(4).ok();
    Ok(LinkRecord {
        url: row.get(0)?,
        target_id: row.get(1)?,
        position: row.get(2)?,
        status: LinkStatus::parse(&row.get::<String>(3)?),
        last_checked: last_checked.map(|s| parse_datetime(&s)),
        message_text: row.get(5).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn get_checkpoint(&self, source_id: i64) -> Result<Option<i64>, DatabaseError> {
        read_checkpoint(self.conn(), source_id).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT source_id, position, updated_at FROM checkpoints ORDER BY source_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?;

        let mut checkpoints = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?
        {
            let updated: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?;
            checkpoints.push(Checkpoint {
                source_id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?,
                position: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?,
                updated_at: parse_datetime(&updated),
            });
        }
        Ok(checkpoints)
    }

    async fn commit_checkpoint(&self, source_id: i64, position: i64) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        write_checkpoint(self.conn(), source_id, position).await
    }

    // ── Dedup ───────────────────────────────────────────────────────

    async fn has_processed(&self, source_id: i64, hash: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_hashes WHERE source_id = ?1 AND hash = ?2",
                params![source_id, hash],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("has_processed: {e}"))),
        }
    }

    async fn record_processed(&self, source_id: i64, hash: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_hash(self.conn(), source_id, hash).await
    }

    async fn commit_delivery(
        &self,
        source_id: i64,
        position: i64,
        hash: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_delivery begin: {e}")))?;

        let result = async {
            write_checkpoint(&tx, source_id, position).await?;
            insert_hash(&tx, source_id, hash).await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit_delivery commit: {e}")))?;
                debug!(source_id, position, "Delivery committed");
                Ok(())
            }
            Err(e) => {
                tx.rollback()
                    .await
                    .map_err(|re| DatabaseError::Query(format!("commit_delivery rollback: {re}")))?;
                Err(e)
            }
        }
    }

    async fn prune_processed(&self, retention_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM processed_hashes WHERE recorded_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_processed: {e}")))?;

        if count > 0 {
            info!(count, retention_days, "Pruned processed hashes");
        }
        Ok(count as usize)
    }

    // ── Credential health ───────────────────────────────────────────

    async fn get_credential_health(
        &self,
        credential_id: &str,
    ) -> Result<Option<CredentialHealth>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HEALTH_COLUMNS} FROM credential_health WHERE credential_id = ?1"),
                params![credential_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_credential_health: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_health(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_credential_health: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_credential_health: {e}"))),
        }
    }

    async fn set_credential_health(&self, health: &CredentialHealth) -> Result<(), DatabaseError> {
        let until = match health.status {
            CredentialStatus::RateLimited { until } => Some(until.to_rfc3339()),
            _ => None,
        };
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO credential_health
                    (credential_id, status, until, consecutive_failures, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (credential_id) DO UPDATE SET
                    status = ?2, until = ?3, consecutive_failures = ?4,
                    last_error = ?5, updated_at = ?6",
                params![
                    health.credential_id.as_str(),
                    health.status.as_str(),
                    opt_text(until.as_deref()),
                    health.consecutive_failures as i64,
                    opt_text(health.last_error.as_deref()),
                    health.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_credential_health: {e}")))?;
        Ok(())
    }

    async fn list_credential_health(&self) -> Result<Vec<CredentialHealth>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HEALTH_COLUMNS} FROM credential_health ORDER BY credential_id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_credential_health: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_credential_health: {e}")))?
        {
            out.push(
                row_to_health(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_credential_health: {e}")))?,
            );
        }
        Ok(out)
    }

    // ── Link checks ─────────────────────────────────────────────────

    async fn upsert_link(
        &self,
        url: &str,
        target_id: i64,
        position: i64,
        message_text: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO link_checks (url, target_id, position, status, message_text)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![url, target_id, position, opt_text(message_text)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_link: {e}")))?;
        Ok(())
    }

    async fn links_to_check(&self, limit: usize) -> Result<Vec<LinkRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT url, target_id, position, status, last_checked, message_text
                 FROM link_checks
                 WHERE status IN ('pending', 'invalid')
                 ORDER BY COALESCE(last_checked, '') ASC, position ASC
                 LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("links_to_check: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("links_to_check: {e}")))?
        {
            out.push(
                row_to_link(&row)
                    .map_err(|e| DatabaseError::Query(format!("links_to_check: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn set_link_status(&self, url: &str, status: LinkStatus) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE link_checks SET status = ?2, last_checked = ?3 WHERE url = ?1",
                params![url, status.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_link_status: {e}")))?;
        Ok(())
    }

    async fn set_link_message_text(
        &self,
        target_id: i64,
        position: i64,
        text: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE link_checks SET message_text = ?3 WHERE target_id = ?1 AND position = ?2",
                params![target_id, position, text],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_link_message_text: {e}")))?;
        Ok(())
    }

    async fn get_link_scan_position(&self, target_id: i64) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT position FROM link_scan_progress WHERE target_id = ?1",
                params![target_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_link_scan_position: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_link_scan_position: {e}"))),
        }
    }

    async fn set_link_scan_position(
        &self,
        target_id: i64,
        position: i64,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO link_scan_progress (target_id, position) VALUES (?1, ?2)
                 ON CONFLICT (target_id) DO UPDATE SET position = MAX(position, ?2)",
                params![target_id, position],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_link_scan_position: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Checkpoint tests ────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_starts_empty() {
        let db = test_db().await;
        assert_eq!(db.get_checkpoint(-100).await.unwrap(), None);
        assert!(db.list_checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_is_monotonic() {
        let db = test_db().await;
        db.commit_checkpoint(-100, 10).await.unwrap();
        db.commit_checkpoint(-100, 11).await.unwrap();

        let err = db.commit_checkpoint(-100, 11).await.unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::StaleCheckpoint {
                source_id: -100,
                current: 11,
                attempted: 11
            }
        ));
        assert!(db.commit_checkpoint(-100, 5).await.is_err());
        assert_eq!(db.get_checkpoint(-100).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn checkpoints_are_independent_per_source() {
        let db = test_db().await;
        db.commit_checkpoint(-1, 50).await.unwrap();
        db.commit_checkpoint(-2, 3).await.unwrap();
        db.commit_checkpoint(-1, 51).await.unwrap();
        db.commit_checkpoint(-2, 4).await.unwrap();

        let all = db.list_checkpoints().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source_id, -2);
        assert_eq!(all[0].position, 4);
        assert_eq!(all[1].position, 51);
    }

    #[tokio::test]
    async fn interleaved_commits_stay_monotonic() {
        let db = Arc::new(test_db().await);
        let mut handles = Vec::new();
        for source in [-1i64, -2, -3] {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                for position in 1..=20 {
                    db.commit_delivery(source, position, &format!("h{position}"))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for source in [-1i64, -2, -3] {
            assert_eq!(db.get_checkpoint(source).await.unwrap(), Some(20));
        }
    }

    // ── Dedup tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn record_and_lookup_hash() {
        let db = test_db().await;
        assert!(!db.has_processed(-1, "abc").await.unwrap());
        db.record_processed(-1, "abc").await.unwrap();
        assert!(db.has_processed(-1, "abc").await.unwrap());
        // Scoped per source
        assert!(!db.has_processed(-2, "abc").await.unwrap());
        // Recording twice is fine
        db.record_processed(-1, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn commit_delivery_writes_both() {
        let db = test_db().await;
        db.commit_delivery(-1, 7, "hash7").await.unwrap();
        assert_eq!(db.get_checkpoint(-1).await.unwrap(), Some(7));
        assert!(db.has_processed(-1, "hash7").await.unwrap());
    }

    #[tokio::test]
    async fn stale_commit_delivery_writes_neither() {
        let db = test_db().await;
        db.commit_delivery(-1, 7, "hash7").await.unwrap();

        let err = db.commit_delivery(-1, 6, "hash6").await.unwrap_err();
        assert!(matches!(err, DatabaseError::StaleCheckpoint { .. }));
        assert_eq!(db.get_checkpoint(-1).await.unwrap(), Some(7));
        assert!(!db.has_processed(-1, "hash6").await.unwrap());
    }

    #[tokio::test]
    async fn prune_removes_only_old_hashes() {
        let db = test_db().await;
        db.record_processed(-1, "fresh").await.unwrap();
        let old = (Utc::now() - chrono::Duration::days(40)).to_rfc3339();
        db.conn()
            .execute(
                "INSERT INTO processed_hashes (source_id, hash, recorded_at) VALUES (-1, 'stale', ?1)",
                params![old],
            )
            .await
            .unwrap();

        let removed = db.prune_processed(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(db.has_processed(-1, "fresh").await.unwrap());
        assert!(!db.has_processed(-1, "stale").await.unwrap());
    }

    // ── Credential health tests ─────────────────────────────────────

    #[tokio::test]
    async fn credential_health_roundtrip() {
        let db = test_db().await;
        assert!(db.get_credential_health("a").await.unwrap().is_none());

        let until = Utc::now() + chrono::Duration::seconds(60);
        let mut health = CredentialHealth::healthy("a");
        health.status = CredentialStatus::RateLimited { until };
        health.last_error = Some("flood".into());
        db.set_credential_health(&health).await.unwrap();

        let fetched = db.get_credential_health("a").await.unwrap().unwrap();
        match fetched.status {
            CredentialStatus::RateLimited { until: got } => {
                assert_eq!(got.timestamp(), until.timestamp());
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
        assert_eq!(fetched.last_error.as_deref(), Some("flood"));

        health.status = CredentialStatus::Disabled;
        health.consecutive_failures = 3;
        db.set_credential_health(&health).await.unwrap();
        let all = db.list_credential_health().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, CredentialStatus::Disabled);
        assert_eq!(all[0].consecutive_failures, 3);
    }

    // ── Link check tests ────────────────────────────────────────────

    #[tokio::test]
    async fn links_rechecked_until_valid() {
        let db = test_db().await;
        db.upsert_link("https://pan.quark.cn/s/a", -5, 10, Some("get https://pan.quark.cn/s/a"))
            .await
            .unwrap();
        db.upsert_link("https://pan.quark.cn/s/b", -5, 11, None).await.unwrap();
        db.upsert_link("https://pan.quark.cn/s/c", -5, 12, None).await.unwrap();
        db.set_link_status("https://pan.quark.cn/s/a", LinkStatus::Invalid)
            .await
            .unwrap();
        db.set_link_status("https://pan.quark.cn/s/c", LinkStatus::Valid)
            .await
            .unwrap();

        // Re-inserting does not reset status
        db.upsert_link("https://pan.quark.cn/s/a", -5, 10, None).await.unwrap();

        let mut due = db.links_to_check(10).await.unwrap();
        due.sort_by_key(|l| l.position);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].url, "https://pan.quark.cn/s/a");
        assert_eq!(due[0].status, LinkStatus::Invalid);
        assert_eq!(due[0].message_text.as_deref(), Some("get https://pan.quark.cn/s/a"));
        assert_eq!(due[1].status, LinkStatus::Pending);
        assert!(due[1].message_text.is_none());

        // A dead link that comes back is marked valid and leaves the queue.
        db.set_link_status("https://pan.quark.cn/s/a", LinkStatus::Valid)
            .await
            .unwrap();
        let due = db.links_to_check(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].url, "https://pan.quark.cn/s/b");
    }

    #[tokio::test]
    async fn message_text_updates_every_link_of_a_message() {
        let db = test_db().await;
        db.upsert_link("https://pan.quark.cn/s/a", -5, 10, Some("old")).await.unwrap();
        db.upsert_link("https://pan.quark.cn/s/b", -5, 10, Some("old")).await.unwrap();
        db.upsert_link("https://pan.quark.cn/s/c", -5, 11, Some("other")).await.unwrap();

        db.set_link_message_text(-5, 10, "new").await.unwrap();

        let mut due = db.links_to_check(10).await.unwrap();
        due.sort_by(|a, b| a.url.cmp(&b.url));
        let texts: Vec<_> = due.iter().map(|l| l.message_text.as_deref()).collect();
        assert_eq!(texts, vec![Some("new"), Some("new"), Some("other")]);
    }

    #[tokio::test]
    async fn link_scan_position_only_moves_forward() {
        let db = test_db().await;
        assert_eq!(db.get_link_scan_position(-5).await.unwrap(), None);
        db.set_link_scan_position(-5, 40).await.unwrap();
        db.set_link_scan_position(-5, 30).await.unwrap();
        assert_eq!(db.get_link_scan_position(-5).await.unwrap(), Some(40));
    }
}

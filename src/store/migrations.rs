//! Relay schema, applied in numbered steps.
//!
//! `schema_version` records every step that ran. A step's DDL and its
//! version row commit in one transaction, so an interrupted upgrade
//! resumes at the failed step.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

struct Step {
    version: i64,
    label: &'static str,
    ddl: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        label: "checkpoints_and_hashes",
        ddl: r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                source_id INTEGER PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS processed_hashes (
                source_id INTEGER NOT NULL,
                hash TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (source_id, hash)
            );
            CREATE INDEX IF NOT EXISTS idx_processed_hashes_recorded_at
                ON processed_hashes(recorded_at);
        "#,
    },
    Step {
        version: 2,
        label: "credential_health",
        ddl: r#"
            CREATE TABLE IF NOT EXISTS credential_health (
                credential_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'healthy',
                until TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Step {
        version: 3,
        label: "link_checks",
        ddl: r#"
            CREATE TABLE IF NOT EXISTS link_checks (
                url TEXT PRIMARY KEY,
                target_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                last_checked TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_link_checks_status ON link_checks(status);
            CREATE TABLE IF NOT EXISTS link_scan_progress (
                target_id INTEGER PRIMARY KEY,
                position INTEGER NOT NULL
            );
        "#,
    },
    Step {
        version: 4,
        label: "link_message_text",
        ddl: r#"
            ALTER TABLE link_checks ADD COLUMN message_text TEXT;
            CREATE INDEX IF NOT EXISTS idx_link_checks_message
                ON link_checks(target_id, position);
        "#,
    },
];

/// Bring the schema up to the latest step.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version: {e}")))?;

    let applied = schema_version(conn).await?;
    for step in STEPS.iter().filter(|s| s.version > applied) {
        info!(version = step.version, label = step.label, "Upgrading schema");
        apply(conn, step).await?;
    }

    let version = schema_version(conn).await?;
    debug!(version, "Schema up to date");
    Ok(())
}

async fn apply(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    let fail = |e: libsql::Error| {
        DatabaseError::Migration(format!("step {} ({}): {e}", step.version, step.label))
    };

    let tx = conn.transaction().await.map_err(fail)?;
    tx.execute_batch(step.ddl).await.map_err(fail)?;
    tx.execute(
        "INSERT INTO schema_version (version, label) VALUES (?1, ?2)",
        libsql::params![step.version, step.label],
    )
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)
}

/// Highest applied step, 0 on a fresh database.
pub(crate) async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema_version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema_version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("decode schema_version: {e}"))),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                libsql::params![name],
            )
            .await
            .unwrap();
        rows.next().await.unwrap().is_some()
    }

    #[tokio::test]
    async fn fresh_database_reaches_latest() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();

        assert_eq!(schema_version(&conn).await.unwrap(), 4);
        for table in [
            "checkpoints",
            "processed_hashes",
            "credential_health",
            "link_checks",
            "link_scan_progress",
        ] {
            assert!(table_exists(&conn, table).await, "missing {table}");
        }
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM schema_version", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn partial_schema_is_upgraded() {
        let conn = fresh().await;
        conn.execute_batch(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                label TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .await
        .unwrap();
        apply(&conn, &STEPS[0]).await.unwrap();
        assert!(!table_exists(&conn, "credential_health").await);

        run_migrations(&conn).await.unwrap();
        assert!(table_exists(&conn, "credential_health").await);
        assert!(table_exists(&conn, "link_checks").await);
        assert_eq!(schema_version(&conn).await.unwrap(), 4);
    }
}

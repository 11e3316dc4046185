//! Unified `Store` trait, a single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// A committed source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub source_id: i64,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

/// Health of a sending credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CredentialStatus {
    Healthy,
    /// Unusable until the given instant.
    RateLimited { until: DateTime<Utc> },
    /// Terminal until an operator re-enables the credential.
    Disabled,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::RateLimited { .. } => "rate_limited",
            Self::Disabled => "disabled",
        }
    }
}

/// Persisted credential health record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialHealth {
    pub credential_id: String,
    pub status: CredentialStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialHealth {
    pub fn healthy(credential_id: &str) -> Self {
        Self {
            credential_id: credential_id.to_string(),
            status: CredentialStatus::Healthy,
            consecutive_failures: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Validity of a tracked link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Pending,
    Valid,
    Invalid,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "valid" => Self::Valid,
            "invalid" => Self::Invalid,
            _ => Self::Pending,
        }
    }
}

/// A link seen in a destination's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRecord {
    pub url: String,
    pub target_id: i64,
    pub position: i64,
    pub status: LinkStatus,
    pub last_checked: Option<DateTime<Utc>>,
    /// Text of the message holding the link, when it was delivered by us.
    pub message_text: Option<String>,
}

/// Backend-agnostic persistence for checkpoints, dedup hashes, credential
/// health and link checks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn get_checkpoint(&self, source_id: i64) -> Result<Option<i64>, DatabaseError>;

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, DatabaseError>;

    /// Advance a source checkpoint. Refuses with `StaleCheckpoint` unless
    /// `position` is strictly greater than the stored one.
    async fn commit_checkpoint(&self, source_id: i64, position: i64) -> Result<(), DatabaseError>;

    // ── Dedup ───────────────────────────────────────────────────────

    async fn has_processed(&self, source_id: i64, hash: &str) -> Result<bool, DatabaseError>;

    async fn record_processed(&self, source_id: i64, hash: &str) -> Result<(), DatabaseError>;

    /// Checkpoint advance and hash record in one transaction.
    async fn commit_delivery(
        &self,
        source_id: i64,
        position: i64,
        hash: &str,
    ) -> Result<(), DatabaseError>;

    /// Delete hashes older than `retention_days`. Returns rows removed.
    async fn prune_processed(&self, retention_days: u32) -> Result<usize, DatabaseError>;

    // ── Credential health ───────────────────────────────────────────

    async fn get_credential_health(
        &self,
        credential_id: &str,
    ) -> Result<Option<CredentialHealth>, DatabaseError>;

    async fn set_credential_health(&self, health: &CredentialHealth) -> Result<(), DatabaseError>;

    async fn list_credential_health(&self) -> Result<Vec<CredentialHealth>, DatabaseError>;

    // ── Link checks ─────────────────────────────────────────────────

    /// Insert a link as pending. Existing records are left untouched.
    async fn upsert_link(
        &self,
        url: &str,
        target_id: i64,
        position: i64,
        message_text: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Pending and invalid links, oldest check first, up to `limit`.
    async fn links_to_check(&self, limit: usize) -> Result<Vec<LinkRecord>, DatabaseError>;

    async fn set_link_status(&self, url: &str, status: LinkStatus) -> Result<(), DatabaseError>;

    /// Replace the stored text of every link held by one message.
    async fn set_link_message_text(
        &self,
        target_id: i64,
        position: i64,
        text: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_link_scan_position(&self, target_id: i64) -> Result<Option<i64>, DatabaseError>;

    async fn set_link_scan_position(
        &self,
        target_id: i64,
        position: i64,
    ) -> Result<(), DatabaseError>;
}

//! Cloud-drive link validity checks.
//!
//! Links enter the table two ways: the dispatcher records them as it
//! delivers, and a run scans the default target's history when the
//! transport can read it. A run then checks pending and invalid links with
//! HTTP HEAD. Links that just went dead are logged, marked in place or have
//! their message deleted, per `LinkCheckMode`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{LinkCheckMode, LinkCheckerConfig};
use crate::error::{DatabaseError, LinkCheckError, TransportError};
use crate::store::{LinkRecord, LinkStatus, Store};
use crate::transport::Session;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'()\[\]{}]+"#).expect("URL pattern is valid")
});

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkCheckReport {
    /// History messages scanned.
    pub scanned: usize,
    /// Links newly recorded (or seen again) during the scan.
    pub discovered: usize,
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Checks that failed at the network level and keep their status.
    pub unreachable: usize,
    /// Previously invalid links that answered again.
    pub recovered: usize,
    pub edited: usize,
    pub deleted: usize,
    /// Edits or deletes the transport refused.
    pub action_failures: usize,
    /// History was unavailable for this transport.
    pub scan_skipped: bool,
}

/// Result of probing a single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Valid,
    Invalid,
    Unreachable,
}

/// Map an HTTP status to a verdict. Anything at or above 400 is invalid.
pub fn classify_status(status: u16) -> LinkHealth {
    if status >= 400 {
        LinkHealth::Invalid
    } else {
        LinkHealth::Valid
    }
}

/// URLs in `text` whose host is one of `domains` or a subdomain of one.
pub fn extract_links(text: &str, domains: &[String]) -> Vec<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']))
        .filter(|candidate| {
            url::Url::parse(candidate)
                .ok()
                .and_then(|u| u.host_str().map(str::to_lowercase))
                .is_some_and(|host| {
                    domains.iter().any(|d| {
                        let d = d.to_lowercase();
                        host == d || host.ends_with(&format!(".{d}"))
                    })
                })
        })
        .map(String::from)
        .collect()
}

/// Record the tracked links of a post we just delivered as pending.
pub async fn track_delivered_links(
    store: &dyn Store,
    domains: &[String],
    chat_id: i64,
    message_id: i64,
    text: &str,
) -> Result<usize, DatabaseError> {
    let links = extract_links(text, domains);
    for link in &links {
        store.upsert_link(link, chat_id, message_id, Some(text)).await?;
    }
    if !links.is_empty() {
        debug!(chat = chat_id, message = message_id, count = links.len(), "Tracking links");
    }
    Ok(links.len())
}

/// Put `marker` after every dead link in `text`, once.
pub fn mark_dead_links(text: &str, dead: &[&str], marker: &str) -> String {
    let mut out = text.to_string();
    for link in dead {
        let marked = format!("{link} {marker}");
        if out.contains(&marked) {
            continue;
        }
        out = out.replace(link, &marked);
    }
    out
}

pub struct LinkChecker {
    store: Arc<dyn Store>,
    http: reqwest::Client,
}

impl LinkChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Scan `target_id` and check due links once.
    pub async fn run_once(
        &self,
        session: Option<Arc<dyn Session>>,
        target_id: i64,
        config: &LinkCheckerConfig,
    ) -> Result<LinkCheckReport, LinkCheckError> {
        if !config.enabled {
            return Err(LinkCheckError::Disabled);
        }
        let session = session.ok_or(LinkCheckError::NoSession)?;

        let mut report = LinkCheckReport::default();
        self.scan(&session, target_id, config, &mut report).await?;
        let newly_dead = self.check_due(config, &mut report).await?;
        self.act_on_dead(&session, newly_dead, config, &mut report).await?;

        info!(
            target = target_id,
            scanned = report.scanned,
            checked = report.checked,
            invalid = report.invalid,
            mode = ?config.mode,
            "Link check complete"
        );
        Ok(report)
    }

    async fn scan(
        &self,
        session: &Arc<dyn Session>,
        target_id: i64,
        config: &LinkCheckerConfig,
        report: &mut LinkCheckReport,
    ) -> Result<(), LinkCheckError> {
        let after = self
            .store
            .get_link_scan_position(target_id)
            .await?
            .unwrap_or(0);

        let history = match session.fetch_history(target_id, after).await {
            Ok(history) => history,
            Err(TransportError::Unsupported(reason)) => {
                warn!(target = target_id, "Link scan skipped: {reason}");
                report.scan_skipped = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut newest = after;
        for message in &history {
            report.scanned += 1;
            for link in extract_links(&message.text, &config.domains) {
                self.store
                    .upsert_link(&link, target_id, message.position, Some(&message.text))
                    .await?;
                report.discovered += 1;
            }
            newest = newest.max(message.position);
        }

        if newest > after {
            self.store.set_link_scan_position(target_id, newest).await?;
        }
        debug!(target = target_id, scanned = report.scanned, "Link scan done");
        Ok(())
    }

    /// Check every due link. Returns links that went from pending to invalid.
    async fn check_due(
        &self,
        config: &LinkCheckerConfig,
        report: &mut LinkCheckReport,
    ) -> Result<Vec<LinkRecord>, LinkCheckError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let mut newly_dead = Vec::new();
        for link in self.store.links_to_check(config.batch_size).await? {
            report.checked += 1;
            match self.head_check(&link.url, timeout).await {
                LinkHealth::Valid => {
                    report.valid += 1;
                    if link.status == LinkStatus::Invalid {
                        report.recovered += 1;
                        info!(url = %link.url, "Link answers again");
                    }
                    self.store.set_link_status(&link.url, LinkStatus::Valid).await?;
                }
                LinkHealth::Invalid => {
                    report.invalid += 1;
                    self.store.set_link_status(&link.url, LinkStatus::Invalid).await?;
                    if link.status == LinkStatus::Pending {
                        warn!(
                            url = %link.url,
                            target = link.target_id,
                            position = link.position,
                            "Invalid link"
                        );
                        newly_dead.push(link);
                    }
                }
                LinkHealth::Unreachable => report.unreachable += 1,
            }
        }
        Ok(newly_dead)
    }

    /// Edit or delete the messages holding newly dead links.
    async fn act_on_dead(
        &self,
        session: &Arc<dyn Session>,
        dead: Vec<LinkRecord>,
        config: &LinkCheckerConfig,
        report: &mut LinkCheckReport,
    ) -> Result<(), LinkCheckError> {
        if config.mode == LinkCheckMode::Log {
            return Ok(());
        }

        let mut by_message: BTreeMap<(i64, i64), Vec<LinkRecord>> = BTreeMap::new();
        for link in dead {
            by_message
                .entry((link.target_id, link.position))
                .or_default()
                .push(link);
        }

        for ((chat, position), links) in by_message {
            match config.mode {
                LinkCheckMode::Log => {}
                LinkCheckMode::Delete => match session.delete_message(chat, position).await {
                    Ok(()) => {
                        report.deleted += 1;
                        info!(chat, position, "Deleted message with dead links");
                    }
                    Err(e) => {
                        report.action_failures += 1;
                        warn!(chat, position, "Delete failed: {e}");
                    }
                },
                LinkCheckMode::Edit => {
                    let Some(text) = links.iter().find_map(|l| l.message_text.clone()) else {
                        debug!(chat, position, "No stored text; cannot mark dead links");
                        continue;
                    };
                    let urls: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
                    let marked = mark_dead_links(&text, &urls, &config.marker);
                    if marked == text {
                        continue;
                    }
                    match session.edit_text(chat, position, &marked).await {
                        Ok(()) => {
                            report.edited += 1;
                            self.store.set_link_message_text(chat, position, &marked).await?;
                            info!(chat, position, links = urls.len(), "Marked dead links");
                        }
                        Err(e) => {
                            report.action_failures += 1;
                            warn!(chat, position, "Edit failed: {e}");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn head_check(&self, url: &str, timeout: Duration) -> LinkHealth {
        match self.http.head(url).timeout(timeout).send().await {
            Ok(resp) => classify_status(resp.status().as_u16()),
            Err(e) => {
                debug!(url, "Link check failed: {e}");
                LinkHealth::Unreachable
            }
        }
    }
}

/// Anything that can run a link check on demand.
#[async_trait::async_trait]
pub trait LinkCheckRunner: Send + Sync {
    async fn run_link_check(&self) -> Result<LinkCheckReport, LinkCheckError>;
}

/// Spawn the cron-driven link check loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop.
pub fn spawn_link_check_scheduler(
    runner: Arc<dyn LinkCheckRunner>,
    schedule: &str,
    tick: Duration,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>), LinkCheckError> {
    let schedule = cron::Schedule::from_str(schedule)
        .map_err(|e| LinkCheckError::InvalidSchedule(e.to_string()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut next_fire = schedule.upcoming(Utc).next();
        info!(next = ?next_fire, "Link check scheduler started");

        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Link check scheduler shutting down");
                return;
            }

            let Some(fire_at) = next_fire else {
                warn!("Link check schedule has no upcoming fire time");
                return;
            };
            if Utc::now() < fire_at {
                continue;
            }

            match runner.run_link_check().await {
                Ok(report) => debug!(?report, "Scheduled link check finished"),
                Err(e) => error!("Scheduled link check failed: {e}"),
            }
            next_fire = schedule.upcoming(Utc).next();
        }
    });

    Ok((handle, shutdown_flag))
}

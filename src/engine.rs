//! Relay engine: owns the active configuration snapshot and the shared
//! services (store, credential pool, resolver, stats).
//!
//! The snapshot is immutable and swapped atomically on reload. A message
//! pass loads it once and uses that view throughout.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{DedupConfig, DispatchConfig, LinkCheckerConfig, RelayConfig};
use crate::dispatch::pool::CredentialPool;
use crate::dispatch::stats::{DispatchStats, SourceStats};
use crate::error::{ConfigError, Error, LinkCheckError};
use crate::link_checker::{LinkCheckReport, LinkCheckRunner, LinkChecker};
use crate::pipeline::filter::FilterEngine;
use crate::pipeline::router::{CompiledRule, DistributionRouter};
use crate::pipeline::transform::ContentTransformer;
use crate::pipeline::types::{DeliveryMode, Destination};
use crate::resolver::IdentifierResolver;
use crate::store::{CredentialHealth, Store};
use crate::transport::{Credential, Session, Transport};

/// A source with its canonical id.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSource {
    pub id: i64,
    pub reference: String,
    pub backfill: bool,
}

/// A routing destination with the reference it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedTarget {
    /// Rule name, or "default".
    pub name: String,
    pub reference: String,
    pub chat_id: i64,
    pub topic_id: Option<i64>,
}

/// Immutable compiled view of one configuration.
#[derive(Debug)]
pub struct Snapshot {
    pub mode: DeliveryMode,
    pub sources: Vec<ResolvedSource>,
    source_ids: HashSet<i64>,
    pub filter: FilterEngine,
    pub router: DistributionRouter,
    pub transformer: ContentTransformer,
    pub dedup: DedupConfig,
    pub dispatch: DispatchConfig,
    pub link_checker: LinkCheckerConfig,
    pub targets: Vec<ResolvedTarget>,
    /// References skipped because they could not be resolved.
    pub unresolved: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

impl Snapshot {
    /// Resolve references and compile filters, rules and replacements.
    ///
    /// Unresolvable sources and rule targets are skipped and reported; an
    /// unresolvable default target fails the whole build.
    pub async fn build(
        config: &RelayConfig,
        resolver: &IdentifierResolver,
        session: Option<&Arc<dyn Session>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let filter =
            FilterEngine::compile(&config.whitelist, &config.ad_filter, &config.content_filter)?;
        let transformer = ContentTransformer::compile(&config.replacements)?;

        let mut unresolved = Vec::new();

        let mut sources = Vec::new();
        let mut source_ids = HashSet::new();
        for source in &config.sources {
            match resolver.resolve(session, &source.reference).await {
                Ok(id) => {
                    if source_ids.insert(id) {
                        sources.push(ResolvedSource {
                            id,
                            reference: source.reference.clone(),
                            backfill: config.backfill_for(source),
                        });
                    }
                }
                Err(e) => {
                    warn!("Skipping source: {e}");
                    unresolved.push(e.to_string());
                }
            }
        }

        let default_id = resolver
            .resolve(session, &config.targets.default)
            .await
            .map_err(|e| ConfigError::InvalidConfiguration(format!("targets.default: {e}")))?;
        let default = Destination {
            chat_id: default_id,
            topic_id: config.targets.default_topic_id,
        };

        let mut targets = vec![ResolvedTarget {
            name: "default".into(),
            reference: config.targets.default.clone(),
            chat_id: default.chat_id,
            topic_id: default.topic_id,
        }];

        let mut rules = Vec::new();
        for rule in &config.targets.rules {
            let chat_id = match resolver.resolve(session, &rule.target).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(rule = %rule.name, "Skipping rule: {e}");
                    unresolved.push(format!("rule '{}': {e}", rule.name));
                    continue;
                }
            };
            let destination = Destination {
                chat_id,
                topic_id: rule.topic_id,
            };
            rules.push(CompiledRule::new(
                &rule.name,
                &rule.all_keywords,
                &rule.any_keywords,
                &rule.file_types,
                &rule.file_name_patterns,
                destination,
            )?);
            targets.push(ResolvedTarget {
                name: rule.name.clone(),
                reference: rule.target.clone(),
                chat_id,
                topic_id: rule.topic_id,
            });
        }

        Ok(Self {
            mode: config.forwarding.mode,
            sources,
            source_ids,
            filter,
            router: DistributionRouter::new(rules, default),
            transformer,
            dedup: config.dedup.clone(),
            dispatch: config.dispatch.clone(),
            link_checker: config.link_checker.clone(),
            targets,
            unresolved,
            loaded_at: Utc::now(),
        })
    }

    pub fn is_source(&self, source_id: i64) -> bool {
        self.source_ids.contains(&source_id)
    }

    pub fn source(&self, source_id: i64) -> Option<&ResolvedSource> {
        self.sources.iter().find(|s| s.id == source_id)
    }
}

/// Per-source status line.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: i64,
    pub reference: String,
    pub checkpoint: Option<i64>,
    #[serde(flatten)]
    pub stats: SourceStats,
}

/// Engine status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uptime_secs: i64,
    pub mode: DeliveryMode,
    pub queue_depth: usize,
    pub stale_checkpoints: u64,
    pub sources: Vec<SourceStatus>,
    pub credentials: Vec<CredentialHealth>,
    pub unresolved: Vec<String>,
    pub snapshot_loaded_at: DateTime<Utc>,
}

/// Resolved identifiers of the active configuration.
#[derive(Debug, Clone, Serialize)]
pub struct DialogExport {
    pub sources: Vec<ResolvedSource>,
    pub targets: Vec<ResolvedTarget>,
    pub unresolved: Vec<String>,
}

/// Summary of a successful reload.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub sources: usize,
    pub rules: usize,
    pub unresolved: Vec<String>,
}

pub struct Engine {
    config_path: Option<PathBuf>,
    snapshot: ArcSwap<Snapshot>,
    resolver: IdentifierResolver,
    store: Arc<dyn Store>,
    pool: Arc<CredentialPool>,
    stats: Arc<DispatchStats>,
    link_checker: LinkChecker,
    started_at: DateTime<Utc>,
    reload_lock: Mutex<()>,
}

impl Engine {
    /// Connect every enabled account, then build the first snapshot.
    pub async fn start(
        config: RelayConfig,
        config_path: Option<PathBuf>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
    ) -> Result<Arc<Self>, Error> {
        let pool = Arc::new(CredentialPool::new(
            Arc::clone(&store),
            config.dispatch.max_auth_failures,
            config.dispatch.rate_limit_padding_secs,
        ));

        for account in config.accounts.iter().filter(|a| a.enabled) {
            let credential = Credential {
                id: account.id.clone(),
                token: account.token.clone(),
            };
            match transport.connect(&credential).await {
                Ok(session) => pool.add(&account.id, Some(session)).await?,
                Err(e) => {
                    warn!(credential = %account.id, "Credential failed to connect: {e}");
                    pool.add(&account.id, None).await?;
                    pool.report_error(&account.id, &e.to_string()).await;
                }
            }
        }

        Self::with_pool(config, config_path, store, pool).await
    }

    /// Build from an already populated pool.
    pub async fn with_pool(
        config: RelayConfig,
        config_path: Option<PathBuf>,
        store: Arc<dyn Store>,
        pool: Arc<CredentialPool>,
    ) -> Result<Arc<Self>, Error> {
        let resolver = IdentifierResolver::new();
        let session = pool.any_session().await;
        let snapshot = Snapshot::build(&config, &resolver, session.as_ref()).await?;

        info!(
            sources = snapshot.sources.len(),
            rules = snapshot.router.rules().len(),
            mode = %snapshot.mode,
            "Engine snapshot ready"
        );

        Ok(Arc::new(Self {
            config_path,
            snapshot: ArcSwap::from_pointee(snapshot),
            resolver,
            link_checker: LinkChecker::new(Arc::clone(&store)),
            store,
            pool,
            stats: Arc::new(DispatchStats::new()),
            started_at: Utc::now(),
            reload_lock: Mutex::new(()),
        }))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Re-read the config file and swap in a new snapshot. On any failure
    /// the previous snapshot stays active.
    pub async fn reload_config(&self) -> Result<ReloadReport, ConfigError> {
        let Some(ref path) = self.config_path else {
            return Err(ConfigError::InvalidConfiguration(
                "engine was started without a config file".into(),
            ));
        };
        let config = RelayConfig::load(path)
            .map_err(|e| ConfigError::InvalidConfiguration(e.to_string()))?;
        self.apply_config(&config).await
    }

    /// Validate, resolve and compile `config`, then swap it in.
    pub async fn apply_config(&self, config: &RelayConfig) -> Result<ReloadReport, ConfigError> {
        let _guard = self.reload_lock.lock().await;

        self.resolver.clear().await;
        let session = self.pool.any_session().await;
        let snapshot = match Snapshot::build(config, &self.resolver, session.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Reload rejected, keeping previous configuration: {e}");
                return Err(match e {
                    ConfigError::InvalidConfiguration(msg) => ConfigError::InvalidConfiguration(msg),
                    other => ConfigError::InvalidConfiguration(other.to_string()),
                });
            }
        };

        let report = ReloadReport {
            sources: snapshot.sources.len(),
            rules: snapshot.router.rules().len(),
            unresolved: snapshot.unresolved.clone(),
        };
        self.snapshot.store(Arc::new(snapshot));
        info!(sources = report.sources, rules = report.rules, "Configuration reloaded");
        Ok(report)
    }

    pub async fn get_status(&self) -> StatusReport {
        let snapshot = self.snapshot();
        let mut sources = Vec::with_capacity(snapshot.sources.len());
        for source in &snapshot.sources {
            let checkpoint = match self.store.get_checkpoint(source.id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(source = source.id, "Failed to read checkpoint: {e}");
                    None
                }
            };
            sources.push(SourceStatus {
                id: source.id,
                reference: source.reference.clone(),
                checkpoint,
                stats: self.stats.source(source.id),
            });
        }

        StatusReport {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            mode: snapshot.mode,
            queue_depth: self.stats.queue_depth(),
            stale_checkpoints: self.stats.stale_checkpoints(),
            sources,
            credentials: self.pool.health().await,
            unresolved: snapshot.unresolved.clone(),
            snapshot_loaded_at: snapshot.loaded_at,
        }
    }

    pub fn export_sources(&self) -> Vec<i64> {
        self.snapshot().sources.iter().map(|s| s.id).collect()
    }

    pub fn export_dialogs(&self) -> DialogExport {
        let snapshot = self.snapshot();
        DialogExport {
            sources: snapshot.sources.clone(),
            targets: snapshot.targets.clone(),
            unresolved: snapshot.unresolved.clone(),
        }
    }

    pub async fn trigger_link_check(&self) -> Result<LinkCheckReport, LinkCheckError> {
        let snapshot = self.snapshot();
        let target = snapshot.router.default_destination().chat_id;
        let session = self.pool.any_session().await;
        self.link_checker
            .run_once(session, target, &snapshot.link_checker)
            .await
    }
}

#[async_trait::async_trait]
impl LinkCheckRunner for Engine {
    async fn run_link_check(&self) -> Result<LinkCheckReport, LinkCheckError> {
        self.trigger_link_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    const BASE: &str = r#"
        [[accounts]]
        id = "main"
        token = "1:x"

        [[sources]]
        reference = "-1001"

        [[sources]]
        reference = "-1002"

        [[sources]]
        reference = "-1001"

        [targets]
        default = "-2000"
        default_topic_id = 4

        [[targets.rules]]
        name = "exe"
        file_name_patterns = ["*.exe"]
        target = "-3000"
        topic_id = 8
    "#;

    async fn engine(raw: &str) -> Arc<Engine> {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = Arc::new(CredentialPool::new(Arc::clone(&store), 3, 0));
        let config = RelayConfig::from_toml(raw).unwrap();
        Engine::with_pool(config, None, store, pool).await.unwrap()
    }

    #[tokio::test]
    async fn snapshot_resolves_numeric_references() {
        let engine = engine(BASE).await;
        assert_eq!(engine.export_sources(), vec![-1001, -1002]);
        let snapshot = engine.snapshot();
        assert!(snapshot.is_source(-1002));
        assert!(!snapshot.is_source(-2000));
        assert_eq!(
            snapshot.router.default_destination(),
            Destination {
                chat_id: -2000,
                topic_id: Some(4)
            }
        );
        assert_eq!(snapshot.router.rules().len(), 1);
    }

    #[tokio::test]
    async fn handle_sources_without_session_are_reported() {
        let raw = format!("{BASE}\n[[sources]]\nreference = \"@some_channel\"\n");
        let engine = engine(&raw).await;
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.sources.len(), 2);
        assert_eq!(snapshot.unresolved.len(), 1);
    }

    #[tokio::test]
    async fn invalid_reload_keeps_previous_snapshot() {
        let engine = engine(BASE).await;
        let before = engine.snapshot().loaded_at;

        let mut bad = RelayConfig::from_toml(BASE).unwrap();
        bad.ad_filter.enable = true;
        bad.ad_filter.patterns = vec!["(".into()];
        let err = engine.apply_config(&bad).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
        assert_eq!(engine.snapshot().loaded_at, before);

        let mut unresolvable_default = RelayConfig::from_toml(BASE).unwrap();
        unresolvable_default.targets.default = "@nobody_here".into();
        assert!(engine.apply_config(&unresolvable_default).await.is_err());
        assert_eq!(engine.export_sources(), vec![-1001, -1002]);
    }

    #[tokio::test]
    async fn valid_reload_swaps_snapshot() {
        let engine = engine(BASE).await;
        let mut next = RelayConfig::from_toml(BASE).unwrap();
        next.sources.truncate(1);
        let report = engine.apply_config(&next).await.unwrap();
        assert_eq!(report.sources, 1);
        assert_eq!(engine.export_sources(), vec![-1001]);
    }

    #[tokio::test]
    async fn reload_without_path_is_rejected() {
        let engine = engine(BASE).await;
        assert!(engine.reload_config().await.is_err());
    }

    #[tokio::test]
    async fn reload_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, BASE).unwrap();

        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = Arc::new(CredentialPool::new(Arc::clone(&store), 3, 0));
        let config = RelayConfig::from_toml(BASE).unwrap();
        let engine = Engine::with_pool(config, Some(path.clone()), store, pool)
            .await
            .unwrap();

        std::fs::write(&path, BASE.replace("reference = \"-1002\"", "reference = \"-1003\"")).unwrap();
        engine.reload_config().await.unwrap();
        assert_eq!(engine.export_sources(), vec![-1001, -1003]);

        std::fs::write(&path, "not toml [").unwrap();
        assert!(engine.reload_config().await.is_err());
        assert_eq!(engine.export_sources(), vec![-1001, -1003]);
    }

    #[tokio::test]
    async fn status_includes_checkpoints() {
        let engine = engine(BASE).await;
        engine.store().commit_checkpoint(-1001, 42).await.unwrap();
        let status = engine.get_status().await;
        assert_eq!(status.sources.len(), 2);
        assert_eq!(status.sources[0].checkpoint, Some(42));
        assert_eq!(status.sources[1].checkpoint, None);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test]
    async fn export_dialogs_lists_targets() {
        let engine = engine(BASE).await;
        let export = engine.export_dialogs();
        assert_eq!(export.targets.len(), 2);
        assert_eq!(export.targets[0].name, "default");
        assert_eq!(export.targets[1].chat_id, -3000);
        assert_eq!(export.targets[1].topic_id, Some(8));
    }
}

//! Receive, process and deliver messages.
//!
//! Task layout:
//! - one receiver per connected session, pushing into a bounded inbound queue
//! - one routing task draining the queue into per-source workers
//! - one worker per source, processing its messages strictly in order
//!
//! Shutdown stops the receivers; queued messages drain through the workers
//! before `run` returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::pool::Lease;
use crate::dispatch::state::{DeliveryState, DeliveryTrace};
use crate::engine::{Engine, Snapshot};
use crate::error::{DatabaseError, DispatchError, PoolError, SendError, TransportError};
use crate::link_checker;
use crate::pipeline::types::{
    DeliveryMode, DeliveryReceipt, Destination, Message, Origin, OutboundPayload, Verdict,
};

/// How often processed hashes are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with ±20% jitter: `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(max_ms);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

pub struct Dispatcher {
    engine: Arc<Engine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run until `shutdown` flips to true, then drain and return.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let sessions = self.engine.pool().sessions().await;
        if sessions.is_empty() {
            return Err(DispatchError::NoSessions);
        }

        let snapshot = self.engine.snapshot();
        let (tx, rx) = mpsc::channel::<Message>(snapshot.dispatch.queue_capacity);

        let prune = self.spawn_pruner(shutdown.clone());

        let mut receivers = Vec::with_capacity(sessions.len());
        for lease in sessions {
            receivers.push(spawn_receiver(
                Arc::clone(&self.engine),
                lease,
                tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(tx);

        let mut router = WorkerRouter::new(Arc::clone(&self.engine));
        // Sources with backfill start walking history before any live post.
        for source in &snapshot.sources {
            router.ensure_worker(source.id);
        }
        let routing = tokio::spawn(router.run(rx));

        info!(
            receivers = receivers.len(),
            sources = snapshot.sources.len(),
            "Dispatcher running"
        );

        // Wait for the stop signal.
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("Dispatcher stopping; draining queued messages");

        for receiver in receivers {
            if let Err(e) = receiver.await {
                warn!("Receiver task failed: {e}");
            }
        }
        routing
            .await
            .map_err(|e| DispatchError::Worker(e.to_string()))?;
        prune.abort();

        info!("Dispatcher stopped");
        Ok(())
    }

    fn spawn_pruner(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let retention = engine.snapshot().dedup.retention_days;
                if let Err(e) = engine.store().prune_processed(retention).await {
                    warn!("Hash pruning failed: {e}");
                }
            }
        })
    }
}

// ── Receivers ───────────────────────────────────────────────────────

fn spawn_receiver(
    engine: Arc<Engine>,
    lease: Lease,
    tx: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let credential = lease.credential_id.clone();
        'connect: loop {
            if *shutdown.borrow() {
                break;
            }

            let failure = match lease.session.receive().await {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        next = stream.next() => next,
                        _ = shutdown.changed() => break 'connect,
                    };
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => break Some(e),
                        None => {
                            debug!(credential = %credential, "Receive stream ended; reconnecting");
                            break None;
                        }
                    };

                    if !engine.snapshot().is_source(message.source_id) {
                        continue;
                    }

                    engine.stats().enqueued();
                    if tx.send(message).await.is_err() {
                        engine.stats().dequeued();
                        break 'connect;
                    }
                },
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                if !receive_failed(&engine, &credential, e).await {
                    break;
                }
            }

            let delay = Duration::from_millis(engine.snapshot().dispatch.reconnect_delay_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        lease.session.close().await;
        debug!(credential = %credential, "Receiver stopped");
    })
}

/// Record a receive failure. Returns false once the credential is disabled.
async fn receive_failed(engine: &Engine, credential: &str, e: TransportError) -> bool {
    match e {
        TransportError::AuthFailed { reason, .. } => {
            if let Err(err) = engine.pool().report_auth_failure(credential, &reason).await {
                warn!(credential = %credential, "Failed to record auth failure: {err}");
            }
            if engine.pool().is_disabled(credential).await {
                error!(credential = %credential, "Credential disabled; receiver stopping");
                return false;
            }
            warn!(credential = %credential, "Receive rejected: {reason}");
            true
        }
        other => {
            warn!(credential = %credential, "Receive failed: {other}");
            engine.pool().report_error(credential, &other.to_string()).await;
            true
        }
    }
}

// ── Routing to per-source workers ───────────────────────────────────

struct WorkerRouter {
    engine: Arc<Engine>,
    workers: HashMap<i64, (mpsc::UnboundedSender<Message>, JoinHandle<()>)>,
}

impl WorkerRouter {
    fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            workers: HashMap::new(),
        }
    }

    fn ensure_worker(&mut self, source_id: i64) -> &mpsc::UnboundedSender<Message> {
        let engine = &self.engine;
        let (sender, _) = self.workers.entry(source_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = SourceWorker::new(Arc::clone(engine), source_id);
            (tx, tokio::spawn(worker.run(rx)))
        });
        sender
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            self.engine.stats().dequeued();
            let source_id = message.source_id;
            if self.ensure_worker(source_id).send(message).is_err() {
                error!(source = source_id, "Source worker is gone; message lost");
            }
        }

        // Inbound closed: let each worker finish its queue.
        let workers = std::mem::take(&mut self.workers);
        for (source_id, (sender, handle)) in workers {
            drop(sender);
            if let Err(e) = handle.await {
                error!(source = source_id, "Source worker panicked: {e}");
            }
        }
    }
}

// ── Per-source worker ───────────────────────────────────────────────

struct SourceWorker {
    engine: Arc<Engine>,
    source_id: i64,
    /// Max of the committed checkpoint and positions handled this run.
    high_water: i64,
}

impl SourceWorker {
    fn new(engine: Arc<Engine>, source_id: i64) -> Self {
        Self {
            engine,
            source_id,
            high_water: i64::MIN,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        match self.engine.store().get_checkpoint(self.source_id).await {
            Ok(Some(checkpoint)) => self.high_water = checkpoint,
            Ok(None) => {}
            Err(e) => warn!(source = self.source_id, "Failed to load checkpoint: {e}"),
        }

        self.backfill().await;

        while let Some(message) = rx.recv().await {
            self.handle(message).await;
        }
        debug!(source = self.source_id, "Source worker finished");
    }

    /// Walk history after the checkpoint when enabled for this source.
    async fn backfill(&mut self) {
        let snapshot = self.engine.snapshot();
        let enabled = snapshot
            .source(self.source_id)
            .is_some_and(|s| s.backfill);
        if !enabled {
            return;
        }

        let Some(session) = self.engine.pool().any_session().await else {
            warn!(source = self.source_id, "No session for backfill");
            return;
        };

        let after = self.high_water.max(0);
        let mut history = match session.fetch_history(self.source_id, after).await {
            Ok(history) => history,
            Err(TransportError::Unsupported(reason)) => {
                warn!(source = self.source_id, "Backfill skipped: {reason}");
                return;
            }
            Err(e) => {
                warn!(source = self.source_id, "Backfill failed: {e}");
                self.engine
                    .stats()
                    .record_error(self.source_id, &format!("backfill: {e}"));
                return;
            }
        };

        history.sort_by_key(|m| m.position);
        info!(source = self.source_id, after, count = history.len(), "Backfilling");
        for message in history {
            self.handle(message.with_origin(Origin::Backfill)).await;
        }
    }

    async fn handle(&mut self, message: Message) -> DeliveryState {
        let position = message.position;
        let trace = self.process(message).await;
        if trace.state != DeliveryState::Skipped {
            self.high_water = self.high_water.max(position);
        }
        self.engine
            .stats()
            .record_outcome(self.source_id, trace.state, trace.last_reason());
        trace.state
    }

    async fn process(&self, message: Message) -> DeliveryTrace {
        let mut trace = DeliveryTrace::new(message.source_id, message.position);

        if message.position <= self.high_water {
            advance(&mut trace, DeliveryState::Skipped, None);
            return trace;
        }

        let snapshot = self.engine.snapshot();
        let store = self.engine.store();
        let hash = message.content_hash();

        if snapshot.dedup.enable {
            match store.has_processed(message.source_id, &hash).await {
                Ok(true) => {
                    debug!(source = message.source_id, position = message.position, "Duplicate content");
                    advance(&mut trace, DeliveryState::Duplicate, None);
                    return trace;
                }
                Ok(false) => {}
                Err(e) => warn!(source = message.source_id, "Dedup lookup failed: {e}"),
            }
        }

        if let Verdict::Reject(reason) = snapshot.filter.evaluate(&message) {
            advance(&mut trace, DeliveryState::Filtered, Some(reason));
            return trace;
        }

        let destination = snapshot.router.route(&message);
        advance(&mut trace, DeliveryState::Routed, Some(destination.to_string()));

        let mut mode = if message.protected {
            DeliveryMode::Copy
        } else {
            snapshot.mode
        };
        let mut payload = self.payload_for(&snapshot, &message, mode, &mut trace);
        advance(&mut trace, DeliveryState::Sending, None);

        let max_attempts = snapshot.dispatch.max_send_attempts.max(1);
        let mut transient_attempts = 0u32;

        loop {
            let lease = match self.engine.pool().acquire().await {
                Ok(lease) => lease,
                Err(PoolError::NoneAvailable {
                    retry_at: Some(retry_at),
                }) => {
                    advance(&mut trace, DeliveryState::Deferred, Some(format!("until {retry_at}")));
                    self.engine.stats().record_deferral(message.source_id);
                    let wait = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(source = message.source_id, position = message.position, ?wait, "Deferred");
                    tokio::time::sleep(wait).await;
                    advance(&mut trace, DeliveryState::Sending, None);
                    continue;
                }
                Err(e) => {
                    error!(source = message.source_id, position = message.position, "No usable credential: {e}");
                    advance(&mut trace, DeliveryState::Dropped, Some(e.to_string()));
                    return trace;
                }
            };

            match lease.session.send(destination, &payload, mode).await {
                Ok(receipt) => {
                    if let Err(e) = self.engine.pool().report_success(&lease.credential_id).await {
                        warn!(credential = %lease.credential_id, "Failed to record success: {e}");
                    }
                    self.commit(&message, &hash).await;
                    self.track_links(&snapshot, destination, &payload, &receipt).await;
                    info!(
                        source = message.source_id,
                        position = message.position,
                        destination = %destination,
                        mode = %mode,
                        origin = ?message.origin,
                        delivered = receipt.delivered_ids.len(),
                        "Delivered"
                    );
                    advance(&mut trace, DeliveryState::Committed, None);
                    return trace;
                }
                Err(SendError::RateLimited { wait }) => {
                    if let Err(e) = self
                        .engine
                        .pool()
                        .report_rate_limited(&lease.credential_id, wait)
                        .await
                    {
                        warn!(credential = %lease.credential_id, "Failed to record rate limit: {e}");
                    }
                    advance(&mut trace, DeliveryState::Sending, Some("rate limited".into()));
                }
                Err(SendError::AuthFailed(reason)) => {
                    if let Err(e) = self
                        .engine
                        .pool()
                        .report_auth_failure(&lease.credential_id, &reason)
                        .await
                    {
                        warn!(credential = %lease.credential_id, "Failed to record auth failure: {e}");
                    }
                    advance(&mut trace, DeliveryState::Sending, Some(reason));
                }
                Err(SendError::ForwardRestricted) if mode == DeliveryMode::Forward => {
                    debug!(source = message.source_id, position = message.position, "Forward refused; copying");
                    mode = DeliveryMode::Copy;
                    payload = self.payload_for(&snapshot, &message, mode, &mut trace);
                    advance(&mut trace, DeliveryState::Sending, None);
                }
                Err(SendError::ForwardRestricted) => {
                    warn!(source = message.source_id, position = message.position, "Copy refused by source");
                    advance(&mut trace, DeliveryState::Dropped, Some("forward restricted".into()));
                    return trace;
                }
                Err(SendError::DestinationGone(reason)) => {
                    warn!(
                        source = message.source_id,
                        position = message.position,
                        destination = %destination,
                        "Destination gone: {reason}"
                    );
                    advance(&mut trace, DeliveryState::Dropped, Some(format!("destination gone: {reason}")));
                    return trace;
                }
                Err(SendError::Transient(reason)) => {
                    transient_attempts += 1;
                    if transient_attempts >= max_attempts {
                        warn!(
                            source = message.source_id,
                            position = message.position,
                            attempts = transient_attempts,
                            "Giving up after transient errors: {reason}"
                        );
                        advance(&mut trace, DeliveryState::Dropped, Some(reason));
                        return trace;
                    }
                    let delay = backoff_delay(
                        transient_attempts,
                        snapshot.dispatch.base_backoff_ms,
                        snapshot.dispatch.max_backoff_ms,
                    );
                    debug!(attempt = transient_attempts, ?delay, "Transient send error: {reason}");
                    self.engine.pool().report_error(&lease.credential_id, &reason).await;
                    tokio::time::sleep(delay).await;
                    advance(&mut trace, DeliveryState::Sending, Some(reason));
                }
            }
        }
    }

    /// Build the outbound unit; copy mode runs the transformer.
    fn payload_for(
        &self,
        snapshot: &Snapshot,
        message: &Message,
        mode: DeliveryMode,
        trace: &mut DeliveryTrace,
    ) -> OutboundPayload {
        match mode {
            DeliveryMode::Forward => OutboundPayload::from_message(message, message.text.clone()),
            DeliveryMode::Copy => {
                let text = snapshot.transformer.transform(&message.text);
                advance(trace, DeliveryState::Transformed, None);
                OutboundPayload::from_message(message, text)
            }
        }
    }

    /// Queue links in a delivered post for the link checker.
    async fn track_links(
        &self,
        snapshot: &Snapshot,
        destination: Destination,
        payload: &OutboundPayload,
        receipt: &DeliveryReceipt,
    ) {
        if !snapshot.link_checker.enabled {
            return;
        }
        // Captions of an album sit on its first message.
        let Some(&delivered) = receipt.delivered_ids.first() else {
            return;
        };
        if let Err(e) = link_checker::track_delivered_links(
            self.engine.store().as_ref(),
            &snapshot.link_checker.domains,
            destination.chat_id,
            delivered,
            &payload.text,
        )
        .await
        {
            warn!(destination = %destination, "Failed to record links: {e}");
        }
    }

    async fn commit(&self, message: &Message, hash: &str) {
        match self
            .engine
            .store()
            .commit_delivery(message.source_id, message.position, hash)
            .await
        {
            Ok(()) => {}
            Err(e @ DatabaseError::StaleCheckpoint { .. }) => {
                error!(source = message.source_id, position = message.position, "Checkpoint refused: {e}");
                self.engine
                    .stats()
                    .record_stale_checkpoint(message.source_id, &e.to_string());
            }
            Err(e) => {
                error!(source = message.source_id, position = message.position, "Commit failed: {e}");
                self.engine.stats().record_error(message.source_id, &e.to_string());
            }
        }
    }
}

fn advance(trace: &mut DeliveryTrace, to: DeliveryState, reason: Option<String>) {
    if let Err(e) = trace.transition_to(to, reason) {
        debug!(source = trace.source_id, position = trace.position, "{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let first = backoff_delay(1, 100, 10_000).as_millis();
            assert!((80..=120).contains(&first), "first = {first}");

            let third = backoff_delay(3, 100, 10_000).as_millis();
            assert!((320..=480).contains(&third), "third = {third}");

            let capped = backoff_delay(30, 100, 1_000).as_millis();
            assert!((800..=1_200).contains(&capped), "capped = {capped}");
        }
    }
}

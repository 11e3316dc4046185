//! Per-message delivery state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// State of one message moving through a source worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Accepted by the worker.
    Received,
    /// At or below the source high-water mark.
    Skipped,
    /// Content hash already delivered for this source.
    Duplicate,
    /// Rejected by the filter engine.
    Filtered,
    /// Destination chosen.
    Routed,
    /// Text rewritten for copy mode.
    Transformed,
    /// A send attempt is in flight.
    Sending,
    /// Waiting for a rate-limited credential to recover.
    Deferred,
    /// Delivered and checkpointed.
    Committed,
    /// Given up on.
    Dropped,
}

impl DeliveryState {
    pub fn can_transition_to(&self, target: DeliveryState) -> bool {
        use DeliveryState::*;

        matches!(
            (self, target),
            (Received, Skipped) | (Received, Duplicate) | (Received, Filtered) | (Received, Routed) |
            (Routed, Transformed) | (Routed, Sending) |
            (Transformed, Sending) |
            // Retries and forward-to-copy fallback re-enter Sending
            (Sending, Sending) | (Sending, Transformed) |
            (Sending, Committed) | (Sending, Deferred) | (Sending, Dropped) |
            (Deferred, Sending) | (Deferred, Dropped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Duplicate | Self::Filtered | Self::Committed | Self::Dropped
        )
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Skipped => "skipped",
            Self::Duplicate => "duplicate",
            Self::Filtered => "filtered",
            Self::Routed => "routed",
            Self::Transformed => "transformed",
            Self::Sending => "sending",
            Self::Deferred => "deferred",
            Self::Committed => "committed",
            Self::Dropped => "dropped",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: DeliveryState,
    pub to: DeliveryState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Tracks one message through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryTrace {
    pub source_id: i64,
    pub position: i64,
    pub state: DeliveryState,
    pub transitions: Vec<StateTransition>,
}

impl DeliveryTrace {
    pub fn new(source_id: i64, position: i64) -> Self {
        Self {
            source_id,
            position,
            state: DeliveryState::Received,
            transitions: Vec::new(),
        }
    }

    pub fn transition_to(
        &mut self,
        new_state: DeliveryState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });

        // Retry loops can be long; keep the tail only.
        const MAX_TRANSITIONS: usize = 64;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        Ok(())
    }

    /// Reason attached to the most recent transition.
    pub fn last_reason(&self) -> Option<&str> {
        self.transitions.last().and_then(|t| t.reason.as_deref())
    }
}

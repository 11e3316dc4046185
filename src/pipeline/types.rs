//! Shared types for the message processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Inbound message ─────────────────────────────────────────────────

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Pushed by a live session.
    Live,
    /// Walked from the source's history.
    Backfill,
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Video,
    Audio,
    Voice,
    Animation,
    Document,
}

impl AttachmentKind {
    /// Bot API input media type for albums.
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video | Self::Animation => "video",
            Self::Audio | Self::Voice => "audio",
            Self::Document => "document",
        }
    }
}

/// Attachment metadata carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Transport handle used to re-send the file.
    pub file_id: Option<String>,
    /// Transport identifier that is stable across re-uploads.
    pub unique_id: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind) -> Self {
        Self {
            kind,
            file_id: None,
            unique_id: None,
            mime_type: None,
            file_name: None,
            size: None,
        }
    }

    pub fn document(file_name: &str, mime_type: &str) -> Self {
        Self {
            file_name: Some(file_name.to_string()),
            mime_type: Some(mime_type.to_string()),
            ..Self::new(AttachmentKind::Document)
        }
    }

    fn identity(&self) -> String {
        match self.unique_id {
            Some(ref id) => format!("id:{id}"),
            None => format!(
                "meta:{}|{}|{}",
                self.mime_type.as_deref().unwrap_or_default().to_lowercase(),
                self.file_name.as_deref().unwrap_or_default().to_lowercase(),
                self.size.map(|s| s.to_string()).unwrap_or_default(),
            ),
        }
    }
}

/// Unified inbound message from a source feed.
///
/// Transport adapters convert their native format into this struct. An album
/// arrives as one message carrying every attachment; `member_positions` lists
/// the transport positions of all parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Canonical source id.
    pub source_id: i64,
    /// Source-local position. For albums, the highest member position.
    pub position: i64,
    /// Message text or caption.
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// All positions belonging to this unit, ascending.
    pub member_positions: Vec<i64>,
    /// The source forbids forwarding its content.
    pub protected: bool,
    pub received_at: DateTime<Utc>,
    pub origin: Origin,
}

impl Message {
    /// Create a plain text message.
    pub fn text(source_id: i64, position: i64, text: impl Into<String>) -> Self {
        Self {
            source_id,
            position,
            text: text.into(),
            attachments: Vec::new(),
            member_positions: vec![position],
            protected: false,
            received_at: Utc::now(),
            origin: Origin::Live,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Iterate attachment filenames.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.attachments
            .iter()
            .filter_map(|a| a.file_name.as_deref())
    }

    /// Iterate attachment MIME types.
    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.attachments
            .iter()
            .filter_map(|a| a.mime_type.as_deref())
    }

    /// Content-identity hash over a normalized projection of text and
    /// attachments. Whitespace and letter case do not contribute.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"t:");
        hasher.update(normalize_text(&self.text).as_bytes());
        for attachment in &self.attachments {
            hasher.update(b"\na:");
            hasher.update(attachment.identity().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Lowercase, trim and collapse whitespace runs.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Outbound ────────────────────────────────────────────────────────

/// How a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Transport-level re-broadcast preserving provenance.
    #[default]
    Forward,
    /// Re-author text and attachments as new output.
    Copy,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

/// A resolved destination: chat plus optional sub-thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub chat_id: i64,
    pub topic_id: Option<i64>,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.topic_id {
            Some(topic) => write!(f, "{}/{}", self.chat_id, topic),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

/// What the transport sends: one atomic unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPayload {
    pub source_id: i64,
    /// Positions to forward (forward mode) or copy from.
    pub positions: Vec<i64>,
    /// Text after transformation (copy mode) or original text (forward).
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl OutboundPayload {
    pub fn from_message(message: &Message, text: String) -> Self {
        Self {
            source_id: message.source_id,
            positions: message.member_positions.clone(),
            text,
            attachments: message.attachments.clone(),
        }
    }
}

/// Confirmation returned by the transport on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Positions of the delivered messages in the destination.
    pub delivered_ids: Vec<i64>,
}

// ── Filter verdict ──────────────────────────────────────────────────

/// Result of the filter engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Reject(String),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

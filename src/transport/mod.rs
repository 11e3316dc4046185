//! Transport abstraction for receiving and delivering messages.
//!
//! A `Transport` turns a credential into a live `Session`. Sessions push
//! inbound messages, walk history, resolve handles and send payloads.

pub mod telegram;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;

use crate::error::{SendError, TransportError};
use crate::pipeline::types::{DeliveryMode, DeliveryReceipt, Destination, Message, OutboundPayload};

pub use telegram::TelegramTransport;

/// Stream of inbound messages from one session. An `Err` item reports why
/// the stream is about to end.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// A sending/receiving credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub token: SecretString,
}

/// Connection factory.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g., "telegram").
    fn name(&self) -> &str;

    /// Open a session for a credential.
    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn Session>, TransportError>;
}

/// A connected credential.
#[async_trait]
pub trait Session: Send + Sync {
    fn credential_id(&self) -> &str;

    /// Start receiving live messages. The stream ends when the session drops
    /// its connection; callers reconnect by calling `receive` again.
    async fn receive(&self) -> Result<MessageStream, TransportError>;

    /// Messages of `source_id` with position greater than `after`, ascending.
    async fn fetch_history(&self, source_id: i64, after: i64)
    -> Result<Vec<Message>, TransportError>;

    /// Deliver one atomic unit.
    async fn send(
        &self,
        destination: Destination,
        payload: &OutboundPayload,
        mode: DeliveryMode,
    ) -> Result<DeliveryReceipt, SendError>;

    /// Resolve a public handle (without `@`) to a canonical id.
    async fn resolve(&self, handle: &str) -> Result<i64, TransportError>;

    /// Replace the text (or caption) of a message we sent.
    async fn edit_text(&self, chat_id: i64, message_id: i64, _text: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!("edit {chat_id}/{message_id}")))
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!("delete {chat_id}/{message_id}")))
    }

    /// Release resources. Default no-op.
    async fn close(&self) {}
}

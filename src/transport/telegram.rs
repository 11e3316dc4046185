//! Telegram transport. Long-polls the Bot API for channel posts and
//! delivers with forward/copy calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::error::{SendError, TransportError};
use crate::pipeline::types::{
    Attachment, AttachmentKind, DeliveryMode, DeliveryReceipt, Destination, Message, Origin,
    OutboundPayload,
};
use crate::transport::{Credential, MessageStream, Session, Transport};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Poll timeout while album parts are waiting to settle.
const SHORT_POLL_SECS: u64 = 1;

/// Quiet period after the last part before an album is complete.
const ALBUM_SETTLE: Duration = Duration::from_secs(2);

/// Telegram Bot API transport.
pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramTransport {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Point at a different Bot API server (self-hosted or test double).
    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
                .build()
                .unwrap_or_default(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for TelegramTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn Session>, TransportError> {
        let session = TelegramSession {
            credential_id: credential.id.clone(),
            token: credential.token.clone(),
            client: self.client.clone(),
            api_base: self.api_base.clone(),
        };

        // getMe validates the token before the session is handed out.
        match session.call("getMe", &json!({})).await {
            Ok(me) => {
                let username = me.get("username").and_then(Value::as_str).unwrap_or("?");
                info!(credential = %credential.id, bot = %username, "Telegram session connected");
                Ok(Arc::new(session))
            }
            Err(ApiFailure::Http { status: 401, .. }) => Err(TransportError::AuthFailed {
                credential: credential.id.clone(),
                reason: "token rejected".into(),
            }),
            Err(e) => Err(TransportError::ConnectFailed {
                credential: credential.id.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// One bot token bound to an HTTP client.
pub struct TelegramSession {
    credential_id: String,
    token: SecretString,
    client: reqwest::Client,
    api_base: String,
}

/// Raw failure of a Bot API call before classification.
#[derive(Debug)]
enum ApiFailure {
    Network(String),
    Http { status: u16, body: Value },
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network: {e}"),
            Self::Http { status, body } => write!(
                f,
                "HTTP {status}: {}",
                body.get("description").and_then(Value::as_str).unwrap_or("")
            ),
        }
    }
}

impl TelegramSession {
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token.expose_secret())
    }

    /// POST a method and return its `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ApiFailure> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            // without_url keeps the token out of error text.
            .map_err(|e| ApiFailure::Network(e.without_url().to_string()))?;

        let status = resp.status().as_u16();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ApiFailure::Network(e.without_url().to_string()))?;

        let ok = data.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok && (200..300).contains(&status) {
            Ok(data.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let status = data
                .get("error_code")
                .and_then(Value::as_u64)
                .map(|c| c as u16)
                .unwrap_or(status);
            Err(ApiFailure::Http { status, body: data })
        }
    }

    async fn call_send(&self, method: &str, body: &Value) -> Result<Value, SendError> {
        self.call(method, body).await.map_err(|failure| match failure {
            ApiFailure::Network(e) => SendError::Transient(e),
            ApiFailure::Http { status, body } => classify_error(status, &body),
        })
    }

    async fn forward(
        &self,
        destination: Destination,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, SendError> {
        let mut body = json!({
            "chat_id": destination.chat_id,
            "from_chat_id": payload.source_id,
        });
        if let Some(topic) = destination.topic_id {
            body["message_thread_id"] = json!(topic);
        }

        if let [single] = payload.positions.as_slice() {
            body["message_id"] = json!(single);
            let result = self.call_send("forwardMessage", &body).await?;
            Ok(DeliveryReceipt {
                delivered_ids: message_ids(&result),
            })
        } else {
            body["message_ids"] = json!(payload.positions);
            let result = self.call_send("forwardMessages", &body).await?;
            Ok(DeliveryReceipt {
                delivered_ids: message_ids(&result),
            })
        }
    }

    async fn copy(
        &self,
        destination: Destination,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, SendError> {
        let (method, body) = build_copy_request(destination, payload);
        let result = self.call_send(method, &body).await?;
        Ok(DeliveryReceipt {
            delivered_ids: message_ids(&result),
        })
    }
}

#[async_trait]
impl Session for TelegramSession {
    fn credential_id(&self) -> &str {
        &self.credential_id
    }

    async fn receive(&self) -> Result<MessageStream, TransportError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = self.api_url("getUpdates");
        let credential = self.credential_id.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            let mut albums = AlbumAssembler::new(ALBUM_SETTLE);

            info!(credential = %credential, "Telegram session listening for posts");

            loop {
                if tx.is_closed() {
                    return;
                }

                let timeout = if albums.is_empty() {
                    POLL_TIMEOUT_SECS
                } else {
                    SHORT_POLL_SECS
                };
                let body = json!({
                    "offset": offset,
                    "timeout": timeout,
                    "allowed_updates": ["channel_post", "message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(credential = %credential, "Telegram poll error: {}", e.without_url());
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if resp.status().as_u16() == 401 {
                    error!(credential = %credential, "Telegram token rejected; ending receive stream");
                    let _ = tx.send(Err(TransportError::AuthFailed {
                        credential: credential.clone(),
                        reason: "getUpdates returned 401".into(),
                    }));
                    return;
                }

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(credential = %credential, "Telegram parse error: {}", e.without_url());
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    let wait = retry_after(&data).unwrap_or(5);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                };

                let (posts, next_offset) = parse_updates(results);
                if let Some(next) = next_offset {
                    offset = next;
                }

                let now = Instant::now();
                for post in posts {
                    albums.push(post, now);
                }
                for message in albums.release(now) {
                    if tx.send(Ok(message)).is_err() {
                        debug!(credential = %credential, "Telegram receive stream closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn fetch_history(
        &self,
        _source_id: i64,
        _after: i64,
    ) -> Result<Vec<Message>, TransportError> {
        Err(TransportError::Unsupported(
            "the Bot API does not expose chat history".into(),
        ))
    }

    async fn send(
        &self,
        destination: Destination,
        payload: &OutboundPayload,
        mode: DeliveryMode,
    ) -> Result<DeliveryReceipt, SendError> {
        match mode {
            DeliveryMode::Forward => self.forward(destination, payload).await,
            DeliveryMode::Copy => self.copy(destination, payload).await,
        }
    }

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), TransportError> {
        let body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        match self.call("editMessageText", &body).await {
            Ok(_) => Ok(()),
            // Media posts carry a caption instead of text.
            Err(ApiFailure::Http { status: 400, body: err }) if describes(&err, "no text in the message") => {
                let body = json!({ "chat_id": chat_id, "message_id": message_id, "caption": text });
                self.call("editMessageCaption", &body)
                    .await
                    .map(|_| ())
                    .map_err(|e| TransportError::Http(e.to_string()))
            }
            Err(e) => Err(TransportError::Http(e.to_string())),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError> {
        let body = json!({ "chat_id": chat_id, "message_id": message_id });
        self.call("deleteMessage", &body)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn resolve(&self, handle: &str) -> Result<i64, TransportError> {
        let body = json!({ "chat_id": format!("@{}", handle.trim_start_matches('@')) });
        match self.call("getChat", &body).await {
            Ok(chat) => chat
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| TransportError::InvalidResponse("getChat without id".into())),
            Err(ApiFailure::Http { status: 400, .. }) => {
                Err(TransportError::NotFound(format!("@{handle}")))
            }
            Err(ApiFailure::Http { status: 429, body }) => Err(TransportError::RateLimited {
                wait: Duration::from_secs(retry_after(&body).unwrap_or(1)),
            }),
            Err(e) => Err(TransportError::Http(e.to_string())),
        }
    }
}

// ── Request building ────────────────────────────────────────────────

/// Choose the copy-mode call for a payload: plain text, one re-sent file,
/// an album, or a server-side copy when file handles are missing.
fn build_copy_request(destination: Destination, payload: &OutboundPayload) -> (&'static str, Value) {
    let mut body = json!({ "chat_id": destination.chat_id });
    if let Some(topic) = destination.topic_id {
        body["message_thread_id"] = json!(topic);
    }

    let all_have_handles = payload.attachments.iter().all(|a| a.file_id.is_some());

    match payload.attachments.as_slice() {
        [] => {
            body["text"] = json!(payload.text);
            ("sendMessage", body)
        }
        [single] if all_have_handles => {
            let (method, field) = match single.kind {
                AttachmentKind::Photo => ("sendPhoto", "photo"),
                AttachmentKind::Video => ("sendVideo", "video"),
                AttachmentKind::Audio => ("sendAudio", "audio"),
                AttachmentKind::Voice => ("sendVoice", "voice"),
                AttachmentKind::Animation => ("sendAnimation", "animation"),
                AttachmentKind::Document => ("sendDocument", "document"),
            };
            body[field] = json!(single.file_id);
            if !payload.text.is_empty() {
                body["caption"] = json!(payload.text);
            }
            (method, body)
        }
        many if all_have_handles => {
            let media: Vec<Value> = many
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    let mut item = json!({ "type": a.kind.media_type(), "media": a.file_id });
                    if i == 0 && !payload.text.is_empty() {
                        item["caption"] = json!(payload.text);
                    }
                    item
                })
                .collect();
            body["media"] = Value::Array(media);
            ("sendMediaGroup", body)
        }
        _ => {
            body["from_chat_id"] = json!(payload.source_id);
            match payload.positions.as_slice() {
                [single] => {
                    body["message_id"] = json!(single);
                    if !payload.text.is_empty() {
                        body["caption"] = json!(payload.text);
                    }
                    ("copyMessage", body)
                }
                many => {
                    body["message_ids"] = json!(many);
                    ("copyMessages", body)
                }
            }
        }
    }
}

/// Extract delivered message ids from a single message or an array result.
fn message_ids(result: &Value) -> Vec<i64> {
    match result {
        Value::Array(items) => items
            .iter()
            .filter_map(|m| m.get("message_id").and_then(Value::as_i64))
            .collect(),
        other => other
            .get("message_id")
            .and_then(Value::as_i64)
            .into_iter()
            .collect(),
    }
}

// ── Error classification ────────────────────────────────────────────

fn describes(body: &Value, needle: &str) -> bool {
    body.get("description")
        .and_then(Value::as_str)
        .is_some_and(|d| d.to_lowercase().contains(needle))
}

fn retry_after(body: &Value) -> Option<u64> {
    body.get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(Value::as_u64)
}

/// Map a failed Bot API response to a send outcome.
pub fn classify_error(status: u16, body: &Value) -> SendError {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let lowered = description.to_lowercase();

    if status == 429 || retry_after(body).is_some() {
        return SendError::RateLimited {
            wait: Duration::from_secs(retry_after(body).unwrap_or(1)),
        };
    }
    if status == 401 {
        return SendError::AuthFailed(description);
    }
    if lowered.contains("can't be forwarded")
        || lowered.contains("protected")
        || lowered.contains("forwards are restricted")
    {
        return SendError::ForwardRestricted;
    }
    if status == 403
        || lowered.contains("chat not found")
        || lowered.contains("thread not found")
        || lowered.contains("topic_deleted")
        || lowered.contains("topic_closed")
    {
        return SendError::DestinationGone(description);
    }
    SendError::Transient(format!("HTTP {status}: {description}"))
}

// ── Update parsing ──────────────────────────────────────────────────

/// A parsed post and the album it belongs to, if any.
#[derive(Debug, Clone)]
pub struct Post {
    pub message: Message,
    pub media_group_id: Option<String>,
}

/// Parse a getUpdates batch into posts. Returns the next offset when the
/// batch was non-empty.
pub fn parse_updates(results: &[Value]) -> (Vec<Post>, Option<i64>) {
    let mut next_offset = None;
    let mut posts = Vec::new();

    for update in results {
        if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
            next_offset = Some(next_offset.map_or(uid + 1, |o: i64| o.max(uid + 1)));
        }

        let Some(raw) = update.get("channel_post").or_else(|| update.get("message")) else {
            continue;
        };
        let Some(message) = parse_message(raw) else {
            continue;
        };
        posts.push(Post {
            message,
            media_group_id: raw
                .get("media_group_id")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }

    (posts, next_offset)
}

struct Held {
    message: Message,
    group: Option<String>,
    last_part: Instant,
}

/// Joins album parts that may span several polls.
///
/// A source's posts are held while any of its albums is still receiving
/// parts, so release order follows arrival order per source. An album is
/// complete once no part arrived for `settle`.
pub struct AlbumAssembler {
    settle: Duration,
    held: BTreeMap<i64, Vec<Held>>,
}

impl AlbumAssembler {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            held: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn push(&mut self, post: Post, now: Instant) {
        let queue = self.held.entry(post.message.source_id).or_default();
        if let Some(ref group) = post.media_group_id {
            if let Some(open) = queue
                .iter_mut()
                .find(|h| h.group.as_deref() == Some(group.as_str()))
            {
                merge_album(&mut open.message, post.message);
                open.last_part = now;
                return;
            }
        }
        queue.push(Held {
            message: post.message,
            group: post.media_group_id,
            last_part: now,
        });
    }

    /// Everything ready to dispatch as of `now`, ordered per source.
    pub fn release(&mut self, now: Instant) -> Vec<Message> {
        let settle = self.settle;
        let mut out = Vec::new();
        for queue in self.held.values_mut() {
            let ready = queue
                .iter()
                .take_while(|h| h.group.is_none() || now.duration_since(h.last_part) >= settle)
                .count();
            let mut batch: Vec<Message> = queue.drain(..ready).map(|h| h.message).collect();
            batch.sort_by_key(|m| m.position);
            out.extend(batch);
        }
        self.held.retain(|_, queue| !queue.is_empty());
        out
    }
}

fn merge_album(album: &mut Message, part: Message) {
    if album.text.is_empty() {
        album.text = part.text;
    }
    album.attachments.extend(part.attachments);
    album.member_positions.extend(part.member_positions);
    album.member_positions.sort_unstable();
    album.member_positions.dedup();
    album.position = album.position.max(part.position);
    album.protected |= part.protected;
}

fn parse_message(raw: &Value) -> Option<Message> {
    let source_id = raw.get("chat")?.get("id")?.as_i64()?;
    let position = raw.get("message_id")?.as_i64()?;
    let text = raw
        .get("text")
        .or_else(|| raw.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let received_at = raw
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(Message {
        source_id,
        position,
        text,
        attachments: parse_attachments(raw),
        member_positions: vec![position],
        protected: raw
            .get("has_protected_content")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        received_at,
        origin: Origin::Live,
    })
}

fn parse_attachments(raw: &Value) -> Vec<Attachment> {
    let mut attachments = Vec::new();

    // Photo sizes come smallest first; keep the largest.
    if let Some(photo) = raw
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
    {
        let mut attachment = file_attachment(AttachmentKind::Photo, photo);
        attachment.mime_type.get_or_insert_with(|| "image/jpeg".into());
        attachments.push(attachment);
    }

    for (field, kind) in [
        ("video", AttachmentKind::Video),
        ("animation", AttachmentKind::Animation),
        ("audio", AttachmentKind::Audio),
        ("voice", AttachmentKind::Voice),
        ("document", AttachmentKind::Document),
    ] {
        // Animations also carry a `document` field; skip the duplicate.
        if field == "document" && raw.get("animation").is_some() {
            continue;
        }
        if let Some(file) = raw.get(field) {
            attachments.push(file_attachment(kind, file));
        }
    }

    attachments
}

fn file_attachment(kind: AttachmentKind, file: &Value) -> Attachment {
    let text = |key: &str| file.get(key).and_then(Value::as_str).map(String::from);
    Attachment {
        kind,
        file_id: text("file_id"),
        unique_id: text("file_unique_id"),
        mime_type: text("mime_type"),
        file_name: text("file_name"),
        size: file.get("file_size").and_then(Value::as_u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TelegramSession {
        TelegramSession {
            credential_id: "main".into(),
            token: SecretString::from("123:ABC".to_string()),
            client: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.into(),
        }
    }

    fn dest(topic: Option<i64>) -> Destination {
        Destination {
            chat_id: -200,
            topic_id: topic,
        }
    }

    #[test]
    fn api_url_includes_token_and_method() {
        assert_eq!(
            session().api_url("getUpdates"),
            "https://api.telegram.org/bot123:ABC/getUpdates"
        );
    }

    #[test]
    fn custom_api_base_trims_slash() {
        let transport = TelegramTransport::with_api_base("http://localhost:8081/");
        assert_eq!(transport.api_base, "http://localhost:8081");
    }

    // ── Classification ──────────────────────────────────────────────

    #[test]
    fn classify_rate_limit() {
        let body = json!({"ok": false, "error_code": 429, "description": "Too Many Requests: retry after 35", "parameters": {"retry_after": 35}});
        assert_eq!(
            classify_error(429, &body),
            SendError::RateLimited {
                wait: Duration::from_secs(35)
            }
        );
    }

    #[test]
    fn classify_auth_failure() {
        let body = json!({"ok": false, "description": "Unauthorized"});
        assert!(matches!(classify_error(401, &body), SendError::AuthFailed(_)));
    }

    #[test]
    fn classify_destination_gone() {
        let body = json!({"ok": false, "description": "Bad Request: chat not found"});
        assert!(matches!(
            classify_error(400, &body),
            SendError::DestinationGone(_)
        ));
        let body = json!({"ok": false, "description": "Bad Request: message thread not found"});
        assert!(matches!(
            classify_error(400, &body),
            SendError::DestinationGone(_)
        ));
        let body = json!({"ok": false, "description": "Forbidden: bot was kicked"});
        assert!(matches!(
            classify_error(403, &body),
            SendError::DestinationGone(_)
        ));
    }

    #[test]
    fn classify_forward_restricted() {
        let body = json!({"ok": false, "description": "Bad Request: message can't be forwarded"});
        assert_eq!(classify_error(400, &body), SendError::ForwardRestricted);
    }

    #[test]
    fn caption_only_edit_is_detected() {
        let body = json!({"ok": false, "description": "Bad Request: there is no text in the message to edit"});
        assert!(describes(&body, "no text in the message"));
        assert!(!describes(&json!({"ok": false}), "no text in the message"));
    }

    #[test]
    fn classify_server_error_is_transient() {
        let body = json!({"ok": false, "description": "Internal Server Error"});
        assert!(matches!(classify_error(502, &body), SendError::Transient(_)));
    }

    // ── Update parsing ──────────────────────────────────────────────

    /// Parse one batch and release everything, as if the albums settled.
    fn assemble(updates: &[Value]) -> Vec<Message> {
        let mut albums = AlbumAssembler::new(Duration::ZERO);
        let now = Instant::now();
        for post in parse_updates(updates).0 {
            albums.push(post, now);
        }
        albums.release(now)
    }

    fn album_part(update_id: i64, message_id: i64, caption: Option<&str>, unique: &str) -> Value {
        let mut post = json!({
            "message_id": message_id,
            "chat": {"id": -1001},
            "media_group_id": "g1",
            "photo": [
                {"file_id": "small", "file_unique_id": "s"},
                {"file_id": format!("big-{unique}"), "file_unique_id": unique, "file_size": 1000}
            ]
        });
        if let Some(c) = caption {
            post["caption"] = json!(c);
        }
        json!({"update_id": update_id, "channel_post": post})
    }

    fn text_post(update_id: i64, message_id: i64, text: &str) -> Value {
        json!({
            "update_id": update_id,
            "channel_post": {"message_id": message_id, "chat": {"id": -1001}, "text": text}
        })
    }

    #[test]
    fn parses_channel_post_text() {
        let updates = vec![json!({
            "update_id": 41,
            "channel_post": {
                "message_id": 7,
                "chat": {"id": -1001, "type": "channel"},
                "date": 1_700_000_000,
                "text": "hello"
            }
        })];
        let (posts, offset) = parse_updates(&updates);
        assert_eq!(offset, Some(42));
        assert_eq!(posts.len(), 1);
        assert!(posts[0].media_group_id.is_none());
        let message = &posts[0].message;
        assert_eq!(message.source_id, -1001);
        assert_eq!(message.position, 7);
        assert_eq!(message.text, "hello");
        assert_eq!(message.origin, Origin::Live);
        assert!(!message.protected);
    }

    #[test]
    fn merges_album_parts() {
        let updates = vec![
            album_part(1, 11, Some("album caption"), "u1"),
            album_part(2, 12, None, "u2"),
            album_part(3, 13, None, "u3"),
        ];
        let messages = assemble(&updates);
        assert_eq!(messages.len(), 1);
        let album = &messages[0];
        assert_eq!(album.position, 13);
        assert_eq!(album.member_positions, vec![11, 12, 13]);
        assert_eq!(album.text, "album caption");
        assert_eq!(album.attachments.len(), 3);
        assert_eq!(album.attachments[0].file_id.as_deref(), Some("big-u1"));
        assert_eq!(album.attachments[0].mime_type.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn album_spanning_two_polls_is_one_unit() {
        let mut albums = AlbumAssembler::new(Duration::from_secs(2));
        let t0 = Instant::now();

        let (first, _) = parse_updates(&[album_part(1, 10, Some("pair"), "u1")]);
        for post in first {
            albums.push(post, t0);
        }
        assert!(albums.release(t0).is_empty());

        let t1 = t0 + Duration::from_secs(1);
        let (second, _) = parse_updates(&[album_part(2, 11, None, "u2"), text_post(3, 12, "after")]);
        for post in second {
            albums.push(post, t1);
        }
        // Still settling: the later text post waits behind the album.
        assert!(albums.release(t1 + Duration::from_millis(500)).is_empty());

        let released = albums.release(t1 + Duration::from_secs(2));
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].member_positions, vec![10, 11]);
        assert_eq!(released[0].attachments.len(), 2);
        assert_eq!(released[0].text, "pair");
        assert_eq!(released[1].position, 12);
        assert!(albums.is_empty());
    }

    #[test]
    fn plain_posts_pass_straight_through() {
        let mut albums = AlbumAssembler::new(Duration::from_secs(2));
        let now = Instant::now();
        let (posts, _) = parse_updates(&[text_post(1, 4, "a"), text_post(2, 5, "b")]);
        for post in posts {
            albums.push(post, now);
        }
        let released: Vec<i64> = albums.release(now).iter().map(|m| m.position).collect();
        assert_eq!(released, vec![4, 5]);
        assert!(albums.is_empty());
    }

    #[test]
    fn parses_document_metadata_and_protection() {
        let updates = vec![json!({
            "update_id": 5,
            "channel_post": {
                "message_id": 3,
                "chat": {"id": -1002},
                "caption": "installer",
                "has_protected_content": true,
                "document": {
                    "file_id": "F",
                    "file_unique_id": "U",
                    "file_name": "setup.exe",
                    "mime_type": "application/x-msdownload",
                    "file_size": 4096
                }
            }
        })];
        let messages = assemble(&updates);
        let m = &messages[0];
        assert!(m.protected);
        assert_eq!(m.text, "installer");
        assert_eq!(m.attachments[0].kind, AttachmentKind::Document);
        assert_eq!(m.attachments[0].file_name.as_deref(), Some("setup.exe"));
        assert_eq!(m.attachments[0].size, Some(4096));
    }

    #[test]
    fn animation_does_not_duplicate_document() {
        let updates = vec![json!({
            "update_id": 1,
            "channel_post": {
                "message_id": 1,
                "chat": {"id": -1},
                "animation": {"file_id": "A", "file_unique_id": "a"},
                "document": {"file_id": "A", "file_unique_id": "a"}
            }
        })];
        let messages = assemble(&updates);
        assert_eq!(messages[0].attachments.len(), 1);
        assert_eq!(messages[0].attachments[0].kind, AttachmentKind::Animation);
    }

    #[test]
    fn skips_updates_without_posts() {
        let updates = vec![json!({"update_id": 9, "edited_channel_post": {}})];
        let (posts, offset) = parse_updates(&updates);
        assert!(posts.is_empty());
        assert_eq!(offset, Some(10));
    }

    // ── Request building ────────────────────────────────────────────

    #[test]
    fn copy_text_uses_send_message_with_thread() {
        let payload = OutboundPayload {
            source_id: -1,
            positions: vec![5],
            text: "hi".into(),
            attachments: vec![],
        };
        let (method, body) = build_copy_request(dest(Some(9)), &payload);
        assert_eq!(method, "sendMessage");
        assert_eq!(body["text"], "hi");
        assert_eq!(body["message_thread_id"], 9);
    }

    #[test]
    fn copy_single_document_resends_file() {
        let mut file = Attachment::document("a.zip", "application/zip");
        file.file_id = Some("F1".into());
        let payload = OutboundPayload {
            source_id: -1,
            positions: vec![5],
            text: "caption".into(),
            attachments: vec![file],
        };
        let (method, body) = build_copy_request(dest(None), &payload);
        assert_eq!(method, "sendDocument");
        assert_eq!(body["document"], "F1");
        assert_eq!(body["caption"], "caption");
        assert!(body.get("message_thread_id").is_none());
    }

    #[test]
    fn copy_album_uses_media_group() {
        let mut a = Attachment::new(AttachmentKind::Photo);
        a.file_id = Some("P1".into());
        let mut b = Attachment::new(AttachmentKind::Video);
        b.file_id = Some("V1".into());
        let payload = OutboundPayload {
            source_id: -1,
            positions: vec![5, 6],
            text: "two".into(),
            attachments: vec![a, b],
        };
        let (method, body) = build_copy_request(dest(None), &payload);
        assert_eq!(method, "sendMediaGroup");
        assert_eq!(body["media"][0]["caption"], "two");
        assert_eq!(body["media"][1]["type"], "video");
        assert!(body["media"][1].get("caption").is_none());
    }

    #[test]
    fn copy_without_handles_falls_back_to_server_copy() {
        let payload = OutboundPayload {
            source_id: -1,
            positions: vec![5],
            text: "x".into(),
            attachments: vec![Attachment::document("a", "b")],
        };
        let (method, body) = build_copy_request(dest(None), &payload);
        assert_eq!(method, "copyMessage");
        assert_eq!(body["from_chat_id"], -1);
        assert_eq!(body["message_id"], 5);
    }

    #[test]
    fn message_ids_from_single_and_array() {
        assert_eq!(message_ids(&json!({"message_id": 4})), vec![4]);
        assert_eq!(
            message_ids(&json!([{"message_id": 4}, {"message_id": 5}])),
            vec![4, 5]
        );
    }

    #[tokio::test]
    async fn history_is_unsupported() {
        let result = session().fetch_history(-1, 0).await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }
}

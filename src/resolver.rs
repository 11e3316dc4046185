//! Source and target reference resolution.
//!
//! A reference is one of:
//! - numeric id: `-1001234567890`, `12345`
//! - handle: `@name` or bare `name`
//! - link: `https://t.me/name`, `t.me/s/name`, `https://t.me/c/<internal>/<msg>`

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ResolveError, TransportError};
use crate::transport::Session;

/// Parsed reference before any transport lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Id(i64),
    Handle(String),
}

impl Reference {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let trimmed = raw.trim();
        let fail = |reason: &str| ResolveError::UnresolvableReference {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(fail("empty reference"));
        }

        if let Ok(id) = trimmed.parse::<i64>() {
            return Ok(Self::Id(id));
        }

        if trimmed.contains("t.me/") || trimmed.contains("telegram.me/") {
            return Self::parse_link(trimmed).ok_or_else(|| fail("unrecognised link"));
        }

        let handle = trimmed.strip_prefix('@').unwrap_or(trimmed);
        if is_valid_handle(handle) {
            Ok(Self::Handle(handle.to_string()))
        } else {
            Err(fail("not a numeric id, handle or link"))
        }
    }

    fn parse_link(link: &str) -> Option<Self> {
        let with_scheme = if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("https://{link}")
        };
        let parsed = url::Url::parse(&with_scheme).ok()?;
        let host = parsed.host_str()?;
        if !matches!(host, "t.me" | "www.t.me" | "telegram.me" | "www.telegram.me") {
            return None;
        }

        let segments: Vec<&str> = parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .collect();

        match segments.as_slice() {
            ["c", internal, ..] => {
                let internal: i64 = internal.parse().ok()?;
                format!("-100{internal}").parse().ok().map(Self::Id)
            }
            ["s", name, ..] | [name, ..] if is_valid_handle(name) => {
                Some(Self::Handle((*name).to_string()))
            }
            _ => None,
        }
    }
}

/// Letters, digits and underscore; 4 to 32 chars; must start with a letter.
fn is_valid_handle(handle: &str) -> bool {
    let len = handle.chars().count();
    (4..=32).contains(&len)
        && handle.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves references to canonical ids, caching handle lookups.
pub struct IdentifierResolver {
    cache: RwLock<HashMap<String, i64>>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a reference. Numeric ids never touch the transport.
    pub async fn resolve(
        &self,
        session: Option<&Arc<dyn Session>>,
        reference: &str,
    ) -> Result<i64, ResolveError> {
        let handle = match Reference::parse(reference)? {
            Reference::Id(id) => return Ok(id),
            Reference::Handle(handle) => handle.to_lowercase(),
        };

        if let Some(id) = self.cache.read().await.get(&handle) {
            return Ok(*id);
        }

        let Some(session) = session else {
            return Err(ResolveError::UnresolvableReference {
                reference: reference.to_string(),
                reason: "no session available for handle lookup".into(),
            });
        };

        let id = session.resolve(&handle).await.map_err(|e| {
            let reason = match e {
                TransportError::NotFound(_) => "entity not found".to_string(),
                other => other.to_string(),
            };
            ResolveError::UnresolvableReference {
                reference: reference.to_string(),
                reason,
            }
        })?;

        debug!(handle = %handle, id, "Resolved handle");
        self.cache.write().await.insert(handle, id);
        Ok(id)
    }

    /// Forget every cached handle.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    #[cfg(test)]
    async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::new()
    }
}

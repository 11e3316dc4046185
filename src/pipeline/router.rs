//! Keyword and attachment based destination routing.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::types::{Destination, Message};

/// A distribution rule with its target already resolved.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    all_keywords: Vec<String>,
    any_keywords: Vec<String>,
    file_types: Vec<String>,
    file_name_patterns: Vec<Regex>,
    pub destination: Destination,
}

impl CompiledRule {
    pub fn new(
        name: &str,
        all_keywords: &[String],
        any_keywords: &[String],
        file_types: &[String],
        file_name_patterns: &[String],
        destination: Destination,
    ) -> Result<Self, ConfigError> {
        let file_name_patterns = file_name_patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::InvalidConfiguration(format!("rule '{name}': {e}")))?;

        Ok(Self {
            name: name.to_string(),
            all_keywords: lowercase(all_keywords),
            any_keywords: lowercase(any_keywords),
            file_types: lowercase(file_types),
            file_name_patterns,
            destination,
        })
    }

    /// `(all empty OR every all-keyword present) AND (or-group empty OR any
    /// member matches)`.
    pub fn matches(&self, message: &Message) -> bool {
        let text = message.text.to_lowercase();

        let all_ok = self.all_keywords.iter().all(|k| text.contains(k.as_str()));
        if !all_ok {
            return false;
        }

        let group_empty = self.any_keywords.is_empty()
            && self.file_types.is_empty()
            && self.file_name_patterns.is_empty();
        if group_empty {
            return true;
        }

        if self.any_keywords.iter().any(|k| text.contains(k.as_str())) {
            return true;
        }

        let type_hit = message.mime_types().any(|mime| {
            let mime = mime.to_lowercase();
            self.file_types.iter().any(|t| mime.contains(t.as_str()))
        });
        if type_hit {
            return true;
        }

        message
            .file_names()
            .any(|name| self.file_name_patterns.iter().any(|re| re.is_match(name)))
    }
}

/// First-match-wins router over compiled rules.
#[derive(Debug, Clone)]
pub struct DistributionRouter {
    rules: Vec<CompiledRule>,
    default: Destination,
}

impl DistributionRouter {
    pub fn new(rules: Vec<CompiledRule>, default: Destination) -> Self {
        Self { rules, default }
    }

    pub fn route(&self, message: &Message) -> Destination {
        for rule in &self.rules {
            if rule.matches(message) {
                debug!(
                    source = message.source_id,
                    position = message.position,
                    rule = %rule.name,
                    destination = %rule.destination,
                    "Rule matched"
                );
                return rule.destination;
            }
        }
        self.default
    }

    pub fn default_destination(&self) -> Destination {
        self.default
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }
}

fn lowercase(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_lowercase())
        .collect()
}

/// Translate a shell glob into an anchored, case-insensitive regex.
/// `*` is any run, `?` is one char, everything else is literal.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut literal = [0u8; 4];
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            _ => pattern.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
}

//! Single-pass text replacement.
//!
//! All entries are combined into one alternation of wrapped groups. At any
//! position the regex engine prefers the leftmost alternative, so the
//! earliest-declared entry wins, and since the scan never revisits emitted
//! text, replacements are not re-scanned.

use regex::{Captures, Regex, RegexBuilder};

use crate::config::ReplacementConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
struct Entry {
    /// Index of this entry's wrapping group in the combined regex.
    group: usize,
    /// Standalone regex for capture expansion (regex entries only).
    own: Option<Regex>,
    replacement: String,
}

/// Compiled replacement table.
#[derive(Debug, Clone, Default)]
pub struct ContentTransformer {
    combined: Option<Regex>,
    entries: Vec<Entry>,
}

impl ContentTransformer {
    pub fn compile(table: &[ReplacementConfig]) -> Result<Self, ConfigError> {
        if table.is_empty() {
            return Ok(Self::default());
        }

        let mut alternatives = Vec::with_capacity(table.len());
        let mut entries = Vec::with_capacity(table.len());
        let mut group = 1;

        for (i, item) in table.iter().enumerate() {
            if item.pattern.is_empty() {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "replacements[{i}]: empty pattern"
                )));
            }

            let source = if item.regex {
                item.pattern.clone()
            } else {
                regex::escape(&item.pattern)
            };
            let own = Regex::new(&source).map_err(|e| {
                ConfigError::InvalidConfiguration(format!("replacements[{i}]: {e}"))
            })?;
            if own.is_match("") {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "replacements[{i}]: pattern '{}' matches the empty string",
                    item.pattern
                )));
            }

            // captures_len counts the implicit whole-match group.
            let inner_groups = own.captures_len() - 1;
            alternatives.push(format!("({source})"));
            entries.push(Entry {
                group,
                own: item.regex.then_some(own),
                replacement: item.replacement.clone(),
            });
            group += 1 + inner_groups;
        }

        let combined = RegexBuilder::new(&alternatives.join("|"))
            .build()
            .map_err(|e| ConfigError::InvalidConfiguration(format!("replacements: {e}")))?;

        Ok(Self {
            combined: Some(combined),
            entries,
        })
    }

    pub fn transform(&self, text: &str) -> String {
        let Some(ref combined) = self.combined else {
            return text.to_string();
        };

        combined
            .replace_all(text, |caps: &Captures<'_>| {
                let Some(entry) = self.entries.iter().find(|e| caps.get(e.group).is_some()) else {
                    return caps[0].to_string();
                };
                match entry.own {
                    Some(ref own) => {
                        let matched = &caps[entry.group];
                        match own.captures(matched) {
                            Some(inner) => {
                                let mut out = String::new();
                                inner.expand(&entry.replacement, &mut out);
                                out
                            }
                            None => entry.replacement.clone(),
                        }
                    }
                    None => entry.replacement.clone(),
                }
            })
            .into_owned()
    }
}

//! Whitelist, ad and content-quality filtering.
//!
//! Evaluation order:
//! - whitelist enabled → pass iff a whitelist keyword is present; nothing
//!   else is consulted
//! - otherwise the ad filter, then the content filter, each only when enabled
//! - no category enabled → pass

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::{AdFilterConfig, ContentFilterConfig, WhitelistConfig};
use crate::error::ConfigError;
use crate::pipeline::types::{Message, Verdict};

/// A keyword matched on token boundaries.
#[derive(Debug, Clone)]
struct WordKeyword {
    needle: String,
    /// Keyword contains unsegmented script; boundaries are not checked.
    substring_only: bool,
}

#[derive(Debug, Clone)]
struct AdFilter {
    substrings: Vec<String>,
    words: Vec<WordKeyword>,
    file_name_keywords: Vec<String>,
    patterns: Vec<Regex>,
}

#[derive(Debug, Clone)]
struct ContentFilter {
    patterns: Vec<Regex>,
    meaningless_words: Vec<String>,
    min_meaningful_length: usize,
}

/// Compiled filter configuration.
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    whitelist: Option<Vec<String>>,
    ad: Option<AdFilter>,
    content: Option<ContentFilter>,
}

impl FilterEngine {
    /// Compile the three filter sections. Any invalid regex rejects the
    /// whole configuration.
    pub fn compile(
        whitelist: &WhitelistConfig,
        ad: &AdFilterConfig,
        content: &ContentFilterConfig,
    ) -> Result<Self, ConfigError> {
        let whitelist = whitelist.enable.then(|| lowercase_all(&whitelist.keywords));

        let ad = if ad.enable {
            Some(AdFilter {
                substrings: lowercase_all(&ad.keywords_substring),
                words: ad
                    .keywords_word
                    .iter()
                    .filter(|k| !k.trim().is_empty())
                    .map(|k| WordKeyword {
                        needle: k.to_lowercase(),
                        substring_only: k.chars().any(is_unsegmented_script),
                    })
                    .collect(),
                file_name_keywords: lowercase_all(&ad.file_name_keywords),
                patterns: compile_patterns("ad_filter.patterns", &ad.patterns)?,
            })
        } else {
            None
        };

        let content = if content.enable {
            Some(ContentFilter {
                patterns: compile_patterns("content_filter.patterns", &content.patterns)?,
                meaningless_words: lowercase_all(&content.meaningless_words),
                min_meaningful_length: content.min_meaningful_length,
            })
        } else {
            None
        };

        Ok(Self {
            whitelist,
            ad,
            content,
        })
    }

    /// Evaluate a message against the compiled filters.
    pub fn evaluate(&self, message: &Message) -> Verdict {
        let text = message.text.to_lowercase();

        if let Some(ref keywords) = self.whitelist {
            return match keywords.iter().find(|k| text.contains(k.as_str())) {
                Some(keyword) => {
                    debug!(source = message.source_id, position = message.position, keyword = %keyword, "Whitelist hit");
                    Verdict::Pass
                }
                None => Verdict::Reject("not-whitelisted".into()),
            };
        }

        if let Some(ref ad) = self.ad {
            if let Some(reason) = ad.check(message, &text) {
                debug!(source = message.source_id, position = message.position, reason = %reason, "Ad filter reject");
                return Verdict::Reject(reason);
            }
        }

        if let Some(ref content) = self.content {
            if let Some(reason) = content.check(message) {
                debug!(source = message.source_id, position = message.position, reason = %reason, "Content filter reject");
                return Verdict::Reject(reason);
            }
        }

        Verdict::Pass
    }
}

impl AdFilter {
    fn check(&self, message: &Message, text: &str) -> Option<String> {
        if let Some(word) = self.words.iter().find(|w| {
            if w.substring_only {
                text.contains(w.needle.as_str())
            } else {
                contains_word(text, &w.needle)
            }
        }) {
            return Some(format!("ad-word:{}", word.needle));
        }

        if let Some(keyword) = self.substrings.iter().find(|k| text.contains(k.as_str())) {
            return Some(format!("ad-keyword:{keyword}"));
        }

        for name in message.file_names() {
            let name = name.to_lowercase();
            if let Some(keyword) = self
                .file_name_keywords
                .iter()
                .find(|k| name.contains(k.as_str()))
            {
                return Some(format!("ad-filename:{keyword}"));
            }
        }

        self.patterns
            .iter()
            .find(|re| re.is_match(&message.text))
            .map(|re| format!("ad-pattern:{}", re.as_str()))
    }
}

impl ContentFilter {
    fn check(&self, message: &Message) -> Option<String> {
        if let Some(re) = self.patterns.iter().find(|re| re.is_match(&message.text)) {
            return Some(format!("content-pattern:{}", re.as_str()));
        }

        let trimmed = message.text.trim();
        let has_attachments = !message.attachments.is_empty();

        if trimmed.is_empty() && !has_attachments {
            return Some("empty".into());
        }

        let lowered = trimmed.to_lowercase();
        if !lowered.is_empty() && self.meaningless_words.iter().any(|w| *w == lowered) {
            return Some("meaningless".into());
        }

        if !has_attachments && trimmed.chars().count() < self.min_meaningful_length {
            return Some("too-short".into());
        }

        None
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_lowercase())
        .collect()
}

fn compile_patterns(key: &str, patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidConfiguration(format!("{key}: '{p}': {e}")))
        })
        .collect()
}

/// Whether `needle` occurs in `haystack` with non-alphanumeric neighbours
/// (or text edges) on both sides. Both inputs are expected lowercased.
pub fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(found) = haystack[start..].find(needle) {
        let begin = start + found;
        let end = begin + needle.len();
        let before_ok = haystack[..begin]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        // Advance by one char past the match start.
        start = begin
            + haystack[begin..]
                .chars()
                .next()
                .map_or(1, char::len_utf8);
    }
    false
}

/// Scripts written without spaces between words.
fn is_unsegmented_script(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x309F      // Hiragana
        | 0x30A0..=0x30FF    // Katakana
        | 0x3400..=0x4DBF    // CJK ext A
        | 0x4E00..=0x9FFF    // CJK unified
        | 0xF900..=0xFAFF    // CJK compatibility
        | 0x20000..=0x2FA1F  // CJK ext B+
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0x1100..=0x11FF    // Hangul jamo
        | 0x0E00..=0x0E7F    // Thai
        | 0x0E80..=0x0EFF    // Lao
        | 0x1780..=0x17FF    // Khmer
        | 0x1000..=0x109F    // Myanmar
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Attachment;

    fn make_message(text: &str) -> Message {
        Message::text(-100, 1, text)
    }

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ad(config: AdFilterConfig) -> FilterEngine {
        FilterEngine::compile(
            &WhitelistConfig::default(),
            &AdFilterConfig {
                enable: true,
                ..config
            },
            &ContentFilterConfig::default(),
        )
        .unwrap()
    }

    fn content(config: ContentFilterConfig) -> FilterEngine {
        FilterEngine::compile(
            &WhitelistConfig::default(),
            &AdFilterConfig::default(),
            &ContentFilterConfig {
                enable: true,
                ..config
            },
        )
        .unwrap()
    }

    #[test]
    fn nothing_enabled_passes_everything() {
        let engine = FilterEngine::default();
        assert!(engine.evaluate(&make_message("")).is_pass());
        assert!(engine.evaluate(&make_message("anything at all")).is_pass());
    }

    #[test]
    fn whitelist_hit_bypasses_blacklist() {
        let engine = FilterEngine::compile(
            &WhitelistConfig {
                enable: true,
                keywords: words(&["Release"]),
            },
            &AdFilterConfig {
                enable: true,
                keywords_substring: words(&["release"]),
                ..Default::default()
            },
            &ContentFilterConfig::default(),
        )
        .unwrap();
        assert!(engine.evaluate(&make_message("New RELEASE out")).is_pass());
    }

    #[test]
    fn whitelist_miss_rejects_even_with_empty_blacklist() {
        let engine = FilterEngine::compile(
            &WhitelistConfig {
                enable: true,
                keywords: words(&["release"]),
            },
            &AdFilterConfig::default(),
            &ContentFilterConfig::default(),
        )
        .unwrap();
        assert_eq!(
            engine.evaluate(&make_message("hello")),
            Verdict::Reject("not-whitelisted".into())
        );
    }

    #[test]
    fn whole_word_respects_boundaries() {
        let engine = ad(AdFilterConfig {
            keywords_word: words(&["ad"]),
            ..Default::default()
        });
        assert!(!engine.evaluate(&make_message("this is an ad.")).is_pass());
        assert!(!engine.evaluate(&make_message("AD: buy now")).is_pass());
        assert!(engine.evaluate(&make_message("read the header")).is_pass());
        assert!(engine.evaluate(&make_message("adobe reader")).is_pass());
    }

    #[test]
    fn substring_keyword_matches_inside_words() {
        let engine = ad(AdFilterConfig {
            keywords_substring: words(&["promo"]),
            ..Default::default()
        });
        assert!(!engine.evaluate(&make_message("superpromotion")).is_pass());
    }

    #[test]
    fn unsegmented_script_word_falls_back_to_substring() {
        let engine = ad(AdFilterConfig {
            keywords_word: words(&["广告"]),
            ..Default::default()
        });
        assert!(!engine.evaluate(&make_message("这是广告内容")).is_pass());
        assert!(engine.evaluate(&make_message("普通消息")).is_pass());
    }

    #[test]
    fn file_name_keyword_rejects() {
        let engine = ad(AdFilterConfig {
            file_name_keywords: words(&["promo"]),
            ..Default::default()
        });
        let message = make_message("look")
            .with_attachment(Attachment::document("PROMO_pack.zip", "application/zip"));
        assert_eq!(
            engine.evaluate(&message),
            Verdict::Reject("ad-filename:promo".into())
        );
    }

    #[test]
    fn ad_patterns_are_case_insensitive() {
        let engine = ad(AdFilterConfig {
            patterns: words(&[r"t\.me/\w+bot"]),
            ..Default::default()
        });
        assert!(!engine.evaluate(&make_message("join T.ME/FreeBot")).is_pass());
    }

    #[test]
    fn invalid_regex_rejects_configuration() {
        let result = FilterEngine::compile(
            &WhitelistConfig::default(),
            &AdFilterConfig {
                enable: true,
                patterns: words(&["(unclosed"]),
                ..Default::default()
            },
            &ContentFilterConfig::default(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
    }

    #[test]
    fn disabled_ad_filter_is_ignored() {
        let engine = FilterEngine::compile(
            &WhitelistConfig::default(),
            &AdFilterConfig {
                enable: false,
                keywords_substring: words(&["spam"]),
                ..Default::default()
            },
            &ContentFilterConfig::default(),
        )
        .unwrap();
        assert!(engine.evaluate(&make_message("spam")).is_pass());
    }

    #[test]
    fn content_filter_rejects_empty_message() {
        let engine = content(ContentFilterConfig::default());
        assert_eq!(
            engine.evaluate(&make_message("   ")),
            Verdict::Reject("empty".into())
        );
        let with_file =
            make_message("").with_attachment(Attachment::document("a.pdf", "application/pdf"));
        assert!(engine.evaluate(&with_file).is_pass());
    }

    #[test]
    fn content_filter_rejects_meaningless_words() {
        let engine = content(ContentFilterConfig {
            meaningless_words: words(&["ok", "+1"]),
            ..Default::default()
        });
        assert!(!engine.evaluate(&make_message(" OK ")).is_pass());
        assert!(!engine.evaluate(&make_message("+1")).is_pass());
        assert!(engine.evaluate(&make_message("ok then")).is_pass());
    }

    #[test]
    fn content_filter_min_length_skips_media() {
        let engine = content(ContentFilterConfig {
            min_meaningful_length: 5,
            ..Default::default()
        });
        assert_eq!(
            engine.evaluate(&make_message("hey")),
            Verdict::Reject("too-short".into())
        );
        let media = make_message("hey").with_attachment(Attachment::document("a.mp4", "video/mp4"));
        assert!(engine.evaluate(&media).is_pass());
        // Counted in chars, not bytes
        assert!(engine.evaluate(&make_message("你好世界啊")).is_pass());
    }

    #[test]
    fn contains_word_edges() {
        assert!(contains_word("ad", "ad"));
        assert!(contains_word("x ad", "ad"));
        assert!(contains_word("[ad]", "ad"));
        assert!(!contains_word("bad ads", "ad"));
        assert!(contains_word("bad ads ad", "ad"));
        assert!(!contains_word("", "ad"));
    }
}

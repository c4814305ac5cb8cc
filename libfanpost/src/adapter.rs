//! Platform content adaptation
//!
//! Turns raw post content into the payload shape each platform agent expects.
//! Adaptation is a pure function of the raw content, the media references and
//! the platform's [`AdaptationRules`]; it performs no I/O.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AdaptError;
use crate::types::Platform;

static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\w+)").expect("valid regex"));
static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

const ELLIPSIS: &str = "...";

/// Per-platform adaptation rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptationRules {
    pub max_text_length: usize,
    #[serde(default = "default_hashtag_format")]
    pub hashtag_format: String,
    #[serde(default)]
    pub requires_media: bool,
    pub max_media: usize,
}

fn default_hashtag_format() -> String {
    "#{}".to_string()
}

impl AdaptationRules {
    /// Built-in rules for a platform
    pub fn builtin(platform: Platform) -> Self {
        let (max_text_length, requires_media, max_media) = match platform {
            Platform::Twitter => (280, false, 4),
            Platform::Facebook => (5000, false, 10),
            Platform::Instagram => (2200, true, 10),
            Platform::Linkedin => (3000, false, 9),
        };
        Self {
            max_text_length,
            hashtag_format: default_hashtag_format(),
            requires_media,
            max_media,
        }
    }
}

/// Content adapted for one platform, tagged by platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum AdaptedContent {
    Facebook { message: String, media: Vec<String> },
    Twitter { text: String, media: Vec<String> },
    Instagram { caption: String, media: Vec<String> },
    Linkedin { commentary: String, media: Vec<String> },
}

impl AdaptedContent {
    pub fn platform(&self) -> Platform {
        match self {
            AdaptedContent::Facebook { .. } => Platform::Facebook,
            AdaptedContent::Twitter { .. } => Platform::Twitter,
            AdaptedContent::Instagram { .. } => Platform::Instagram,
            AdaptedContent::Linkedin { .. } => Platform::Linkedin,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            AdaptedContent::Facebook { message, .. } => message,
            AdaptedContent::Twitter { text, .. } => text,
            AdaptedContent::Instagram { caption, .. } => caption,
            AdaptedContent::Linkedin { commentary, .. } => commentary,
        }
    }

    pub fn media(&self) -> &[String] {
        match self {
            AdaptedContent::Facebook { media, .. }
            | AdaptedContent::Twitter { media, .. }
            | AdaptedContent::Instagram { media, .. }
            | AdaptedContent::Linkedin { media, .. } => media,
        }
    }
}

/// Adapts raw content using built-in rules, optionally overridden per platform
#[derive(Debug, Clone)]
pub struct ContentAdapter {
    rules: HashMap<Platform, AdaptationRules>,
}

impl Default for ContentAdapter {
    fn default() -> Self {
        Self {
            rules: Platform::ALL
                .iter()
                .map(|p| (*p, AdaptationRules::builtin(*p)))
                .collect(),
        }
    }
}

impl ContentAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rules for one platform
    pub fn with_rules(mut self, platform: Platform, rules: AdaptationRules) -> Self {
        self.rules.insert(platform, rules);
        self
    }

    pub fn rules(&self, platform: Platform) -> AdaptationRules {
        self.rules
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| AdaptationRules::builtin(platform))
    }

    /// Adapt content for one platform
    ///
    /// # Errors
    ///
    /// - `AdaptError::MediaRequired` when the platform needs media and none is given
    /// - `AdaptError::EmptyContent` when neither text nor media remain
    pub fn adapt(
        &self,
        platform: Platform,
        raw_content: &str,
        media_references: &[String],
    ) -> Result<AdaptedContent, AdaptError> {
        let rules = self.rules(platform);

        let media = normalize_media(media_references, rules.max_media);
        if rules.requires_media && media.is_empty() {
            return Err(AdaptError::MediaRequired { platform });
        }

        let text = adapt_text(raw_content, &rules);
        if text.is_empty() && media.is_empty() {
            return Err(AdaptError::EmptyContent { platform });
        }

        Ok(match platform {
            Platform::Facebook => AdaptedContent::Facebook {
                message: text,
                media,
            },
            Platform::Twitter => AdaptedContent::Twitter { text, media },
            Platform::Instagram => AdaptedContent::Instagram {
                caption: text,
                media,
            },
            Platform::Linkedin => AdaptedContent::Linkedin {
                commentary: text,
                media,
            },
        })
    }
}

/// Hashtags in order of first appearance, without the `#`
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for cap in HASHTAG.captures_iter(text) {
        let tag = cap[1].to_string();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Truncate to at most `max_chars` characters, cutting at a word boundary and
/// marking the cut with an ellipsis
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }

    let budget = max_chars - ELLIPSIS.len();
    let head: String = text.chars().take(budget).collect();
    let cut = match head.rfind(' ') {
        Some(idx) if idx > 0 => head[..idx].trim_end().to_string(),
        _ => head,
    };
    format!("{}{}", cut, ELLIPSIS)
}

fn adapt_text(raw_content: &str, rules: &AdaptationRules) -> String {
    let hashtags = extract_hashtags(raw_content);
    let body = HASHTAG.replace_all(raw_content, "");
    let body = INLINE_SPACE.replace_all(&body, " ");
    let body = body.trim();

    if hashtags.is_empty() {
        return truncate_text(body, rules.max_text_length);
    }

    let hashtag_text = hashtags
        .iter()
        .map(|tag| rules.hashtag_format.replace("{}", tag))
        .collect::<Vec<_>>()
        .join(" ");
    let hashtag_len = hashtag_text.chars().count();

    if hashtag_len + 1 > rules.max_text_length {
        // Hashtags alone do not fit: keep half the budget for the body
        return truncate_text(body, rules.max_text_length / 2);
    }

    let body = truncate_text(body, rules.max_text_length - hashtag_len - 1);
    if body.is_empty() {
        hashtag_text
    } else {
        format!("{} {}", body, hashtag_text)
    }
}

fn normalize_media(media_references: &[String], max_media: usize) -> Vec<String> {
    let mut media: Vec<String> = Vec::new();
    for reference in media_references {
        let reference = reference.trim();
        if reference.is_empty() || media.iter().any(|m| m == reference) {
            continue;
        }
        media.push(reference.to_string());
    }
    media.truncate(max_media);
    media
}

//! Rich-text facet detection for Bluesky posts
//!
//! Bluesky does not linkify text on its own; links, hashtags and mentions
//! must be sent as facets addressing UTF-8 byte ranges of the post text.
//! Links and tags are detected here directly. Mentions are detected as
//! [`Mention`] candidates; the publisher resolves each handle to a DID and
//! turns the resolvable ones into facets with [`Mention::into_facet`].

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

const LINK_TYPE: &str = "app.bsky.richtext.facet#link";
const TAG_TYPE: &str = "app.bsky.richtext.facet#tag";
const MENTION_TYPE: &str = "app.bsky.richtext.facet#mention";

/// TLDs accepted for scheme-less links and handles
const KNOWN_TLDS: &[&str] = &[
    // generic
    "app", "art", "biz", "blog", "cafe", "city", "cloud", "club", "codes", "coffee", "com",
    "design", "dev", "edu", "email", "fyi", "games", "garden", "gov", "info", "int", "link",
    "live", "lol", "media", "mil", "moe", "music", "net", "network", "news", "online", "org",
    "page", "photo", "place", "pub", "science", "site", "social", "software", "space",
    "studio", "systems", "tech", "tools", "town", "website", "wiki", "world", "xyz", "zone",
    // country codes
    "ac", "ai", "at", "au", "be", "br", "ca", "cc", "ch", "cl", "cn", "co", "cz", "de", "dk",
    "es", "eu", "fi", "fm", "fr", "gg", "gl", "gr", "hk", "ie", "il", "in", "io", "is", "it",
    "jp", "kr", "la", "li", "lt", "lu", "lv", "ly", "me", "mx", "nl", "no", "nz", "pl", "pt",
    "re", "ro", "rs", "ru", "se", "sg", "sh", "si", "sk", "so", "st", "to", "tv", "tw", "ua",
    "uk", "us", "vc", "ws", "za",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Facet {
    pub index: ByteSlice,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteSlice {
    pub byte_start: usize,
    pub byte_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "$type")]
pub enum Feature {
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
    #[serde(rename = "app.bsky.richtext.facet#tag")]
    Tag { tag: String },
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention { did: String },
}

impl Feature {
    pub fn type_name(&self) -> &'static str {
        match self {
            Feature::Link { .. } => LINK_TYPE,
            Feature::Tag { .. } => TAG_TYPE,
            Feature::Mention { .. } => MENTION_TYPE,
        }
    }
}

/// An `@handle.domain` span awaiting DID resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// Covers the handle including its `@`
    pub index: ByteSlice,
    /// Handle without the `@`
    pub handle: String,
}

impl Mention {
    pub fn into_facet(self, did: String) -> Facet {
        Facet {
            index: self.index,
            features: vec![Feature::Mention { did }],
        }
    }
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[\s(])((?:https?://\S+)|(?:[a-zA-Z][a-zA-Z0-9-]*(?:\.[a-zA-Z0-9-]+)+\S*))")
            .expect("valid link regex")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?:^|\s)(#[\p{L}\p{N}_]+)").expect("valid tag regex"))
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[\s(])(@([a-zA-Z0-9.-]+)\b)").expect("valid mention regex")
    })
}

/// Detect link and hashtag facets in `text`, ordered by position
pub fn detect_facets(text: &str) -> Vec<Facet> {
    let mut facets = Vec::new();

    for caps in link_pattern().captures_iter(text) {
        let Some(found) = caps.get(1) else { continue };
        let link = trim_link(found.as_str());

        let uri = if link.starts_with("http://") || link.starts_with("https://") {
            if link.len() <= "https://".len() {
                continue;
            }
            link.to_string()
        } else {
            let host = link.split(&['/', ':', '?', '#'][..]).next().unwrap_or_default();
            if !is_domain(host) {
                continue;
            }
            format!("https://{}", link)
        };

        facets.push(Facet {
            index: ByteSlice {
                byte_start: found.start(),
                byte_end: found.start() + link.len(),
            },
            features: vec![Feature::Link { uri }],
        });
    }

    for caps in tag_pattern().captures_iter(text) {
        let Some(found) = caps.get(1) else { continue };
        let tag = &found.as_str()[1..];
        // "#1" is a number, not a tag
        if tag.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        facets.push(Facet {
            index: ByteSlice {
                byte_start: found.start(),
                byte_end: found.end(),
            },
            features: vec![Feature::Tag {
                tag: tag.to_string(),
            }],
        });
    }

    sort_facets(&mut facets);
    facets
}

/// Detect `@handle.domain` mentions in `text`, ordered by position
pub fn detect_mentions(text: &str) -> Vec<Mention> {
    mention_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let span = caps.get(1)?;
            let handle = caps.get(2)?.as_str();
            if !is_domain(handle) {
                return None;
            }
            Some(Mention {
                index: ByteSlice {
                    byte_start: span.start(),
                    byte_end: span.end(),
                },
                handle: handle.to_ascii_lowercase(),
            })
        })
        .collect()
}

pub fn sort_facets(facets: &mut [Facet]) {
    facets.sort_by_key(|facet| facet.index.byte_start);
}

/// Strip sentence punctuation, and closing parens that were never opened
fn trim_link(candidate: &str) -> &str {
    let mut link = candidate;
    loop {
        let trimmed = link
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '\''));
        let unbalanced = trimmed.matches(')').count() > trimmed.matches('(').count();
        let trimmed = match trimmed.strip_suffix(')') {
            Some(inner) if unbalanced => inner,
            _ => trimmed,
        };
        if trimmed.len() == link.len() {
            return link;
        }
        link = trimmed;
    }
}

/// Dotted hostname whose last label looks like a real TLD
fn is_domain(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    if labels
        .iter()
        .any(|label| label.is_empty() || label.starts_with('-') || label.ends_with('-'))
    {
        return false;
    }

    let tld = labels[labels.len() - 1].to_ascii_lowercase();
    KNOWN_TLDS.contains(&tld.as_str())
}

//! Source post model
//!
//! [`RawPost`] is what the feed hands us; [`EligiblePost`] is a raw post that
//! survived filtering, keyed by its publish time in milliseconds. The wire
//! types at the bottom map an ActivityPub outbox page onto raw posts.

use chrono::DateTime;
use serde::Deserialize;

/// Activity type for newly created posts
pub const ACTIVITY_CREATE: &str = "Create";

/// Object type for plain text posts
pub const OBJECT_NOTE: &str = "Note";

/// An item from the source feed, as delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPost {
    /// Activity tag, e.g. "Create", "Update", "Announce"
    pub activity_type: String,
    /// Object tag, e.g. "Note"; empty when the object is a bare link
    pub object_type: String,
    /// HTML body
    pub content: String,
    /// Canonical permalink
    pub url: String,
    /// RFC 3339 publish timestamp
    pub published_at: String,
    /// URL of the parent post, if this is a reply
    pub in_reply_to: Option<String>,
}

impl RawPost {
    /// Publish time as milliseconds since the epoch, if the timestamp parses
    pub fn sort_key(&self) -> Option<i64> {
        DateTime::parse_from_rfc3339(self.published_at.trim())
            .ok()
            .map(|dt| dt.timestamp_millis())
    }
}

/// A post that passed type and reply-scope filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligiblePost {
    pub post: RawPost,
    pub sort_key: i64,
}

// =============================================================================
// ActivityPub outbox wire format
// =============================================================================

/// One page of an ActivityPub `OrderedCollectionPage`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxPage {
    #[serde(default)]
    pub ordered_items: Vec<Activity>,
}

#[derive(Debug, Deserialize)]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub published: String,
    pub object: Option<ActivityObject>,
}

/// Boosts carry the boosted post as a bare URL instead of an embedded object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ActivityObject {
    Embedded(Note),
    Link(String),
    /// Any other shape; filtered out as an unknown object type
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

impl From<Activity> for RawPost {
    fn from(activity: Activity) -> Self {
        let (object_type, content, url, in_reply_to) = match activity.object {
            Some(ActivityObject::Embedded(note)) => (
                note.kind,
                note.content.unwrap_or_default(),
                note.url.or(note.id).unwrap_or_default(),
                note.in_reply_to,
            ),
            Some(ActivityObject::Link(url)) => (String::new(), String::new(), url, None),
            Some(ActivityObject::Other(_)) | None => {
                (String::new(), String::new(), String::new(), None)
            }
        };

        RawPost {
            activity_type: activity.kind,
            object_type,
            content,
            url,
            published_at: activity.published,
            in_reply_to,
        }
    }
}

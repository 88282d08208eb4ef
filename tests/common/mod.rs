/// Common test utilities and helpers for crossposter tests
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crossposter::config::DestinationConfig;
use crossposter::{
    BlueskyPublisher, CrosspostCycle, FileBackend, OutboxFetcher, WatermarkStore,
};

pub const OUTBOX_PATH: &str = "/users/alice/outbox";
pub const CREATE_RECORD_PATH: &str = "/xrpc/com.atproto.repo.createRecord";

/// Mock source and destination servers plus a scratch state directory
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub mastodon: MockServer,
    pub bluesky: MockServer,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let env = Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
            mastodon: MockServer::start().await,
            bluesky: MockServer::start().await,
        };
        env.mount_bluesky().await;
        env
    }

    pub fn user_prefix(&self) -> String {
        format!("{}/users/alice", self.mastodon.uri())
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.temp_dir.path().join("data").join("lastPostId.txt")
    }

    /// Serve `activities` as the first outbox page, replacing any earlier page
    pub async fn serve_outbox(&self, activities: Vec<Value>) {
        self.mastodon.reset().await;
        Mock::given(method("GET"))
            .and(path(OUTBOX_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "OrderedCollectionPage",
                "orderedItems": activities,
            })))
            .mount(&self.mastodon)
            .await;
    }

    async fn mount_bluesky(&self) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": "jwt",
                "refreshJwt": "refresh",
                "did": "did:plc:alice",
                "handle": "alice.test"
            })))
            .mount(&self.bluesky)
            .await;

        Mock::given(method("POST"))
            .and(path(CREATE_RECORD_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/1",
                "cid": "bafy"
            })))
            .mount(&self.bluesky)
            .await;
    }

    pub fn destination_config(&self) -> DestinationConfig {
        DestinationConfig {
            service: self.bluesky.uri(),
            identifier: "alice.test".to_string(),
            password_env: "UNUSED".to_string(),
            timeout: 5,
        }
    }

    /// Build a cycle the way a fresh process would, loading the watermark file
    pub fn start_cycle(&self) -> CrosspostCycle {
        let fetcher = OutboxFetcher::with_outbox_url(
            format!("{}{}?page=true", self.mastodon.uri(), OUTBOX_PATH),
            Duration::from_secs(5),
        )
        .expect("Failed to build fetcher");
        let publisher = BlueskyPublisher::new(&self.destination_config(), "pw".to_string())
            .expect("Failed to build publisher");

        CrosspostCycle::new(
            std::sync::Arc::new(fetcher),
            std::sync::Arc::new(publisher),
            WatermarkStore::new(Box::new(FileBackend::new(self.watermark_path()))),
            self.user_prefix(),
            Duration::from_secs(5),
        )
    }

    /// Texts sent to the destination so far, in order
    pub async fn published_texts(&self) -> Vec<String> {
        self.bluesky
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == CREATE_RECORD_PATH)
            .filter_map(|request| {
                let body: Value = serde_json::from_slice(&request.body).ok()?;
                body["record"]["text"].as_str().map(str::to_string)
            })
            .collect()
    }

    pub fn stored_watermark(&self) -> Option<String> {
        std::fs::read_to_string(self.watermark_path()).ok()
    }
}

/// Builder for outbox activities
pub struct ActivityBuilder {
    kind: String,
    object_kind: String,
    published: String,
    content: String,
    url: String,
    in_reply_to: Option<String>,
}

impl ActivityBuilder {
    /// A new note published `seconds` after 2024-01-01T00:00:00Z
    pub fn note(seconds: u32, content: &str) -> Self {
        Self {
            kind: "Create".to_string(),
            object_kind: "Note".to_string(),
            published: format!(
                "2024-01-01T{:02}:{:02}:{:02}Z",
                seconds / 3600,
                (seconds / 60) % 60,
                seconds % 60
            ),
            content: content.to_string(),
            url: format!("https://social.example/@alice/{}", seconds),
            in_reply_to: None,
        }
    }

    pub fn edited(mut self) -> Self {
        self.kind = "Update".to_string();
        self
    }

    pub fn reply_to(mut self, parent: &str) -> Self {
        self.in_reply_to = Some(parent.to_string());
        self
    }

    pub fn build(self) -> Value {
        json!({
            "type": self.kind,
            "published": self.published,
            "object": {
                "type": self.object_kind,
                "url": self.url,
                "content": self.content,
                "inReplyTo": self.in_reply_to,
            }
        })
    }
}

/// Milliseconds since epoch of [`ActivityBuilder::note`]'s timestamp
pub fn millis_at(seconds: u32) -> i64 {
    (1_704_067_200 + seconds as i64) * 1000
}

/// A boost of someone else's post
pub fn boost(seconds: u32) -> Value {
    json!({
        "type": "Announce",
        "published": format!("2024-01-01T00:00:{:02}Z", seconds % 60),
        "object": "https://other.example/users/bob/statuses/1"
    })
}

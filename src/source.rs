//! Source feed retrieval
//!
//! [`FeedFetcher`] is the boundary the crossposting cycle reads from.
//! [`OutboxFetcher`] implements it against a Mastodon account's ActivityPub
//! outbox, which avoids having to resolve the account's internal ID first.

use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::post::{OutboxPage, RawPost};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Retrieves the most recent posts, newest first
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_recent_posts(&self) -> Result<Vec<RawPost>, FetchError>;
}

/// Reads the first page of an ActivityPub outbox
pub struct OutboxFetcher {
    client: reqwest::Client,
    outbox_url: String,
}

impl OutboxFetcher {
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        Self::with_outbox_url(config.outbox_url(), Duration::from_secs(config.timeout))
    }

    /// Point the fetcher at an explicit outbox page URL
    pub fn with_outbox_url(outbox_url: String, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crossposter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, outbox_url })
    }

    pub fn outbox_url(&self) -> &str {
        &self.outbox_url
    }
}

#[async_trait]
impl FeedFetcher for OutboxFetcher {
    async fn fetch_recent_posts(&self) -> Result<Vec<RawPost>, FetchError> {
        debug!("Fetching outbox page: {}", self.outbox_url);

        let response = self
            .client
            .get(&self.outbox_url)
            .header(reqwest::header::ACCEPT, "application/activity+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let page: OutboxPage =
            serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))?;

        let posts: Vec<RawPost> = page.ordered_items.into_iter().map(RawPost::from).collect();
        debug!("Outbox returned {} items", posts.len());

        Ok(posts)
    }
}

//! Destination publishing
//!
//! [`Publisher`] is the boundary the crossposting cycle writes to.
//! [`BlueskyPublisher`] posts through the AT Protocol XRPC API using an app
//! password; [`DryRunPublisher`] only logs what would have been posted.

use crate::config::DestinationConfig;
use crate::error::PublishError;
use crate::facets::{detect_facets, detect_mentions, sort_facets, Facet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Identifier of a published post on the destination
pub type PostId = String;

/// Accepts formatted text and publishes it
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, text: &str) -> Result<PostId, PublishError>;
}

// =============================================================================
// Dry run
// =============================================================================

/// Logs the would-be post and publishes nothing
#[derive(Debug, Default)]
pub struct DryRunPublisher;

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, text: &str) -> Result<PostId, PublishError> {
        info!(dry_run = true, "Would post to Bluesky: {}", text);
        Ok("dry-run".to_string())
    }
}

// =============================================================================
// Bluesky
// =============================================================================

const POST_COLLECTION: &str = "app.bsky.feed.post";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    record: PostRecord<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord<'a> {
    #[serde(rename = "$type")]
    kind: &'a str,
    text: &'a str,
    created_at: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    facets: Vec<Facet>,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Default, Deserialize)]
struct XrpcError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Publishes posts to a Bluesky PDS with an app password
pub struct BlueskyPublisher {
    client: reqwest::Client,
    service: String,
    identifier: String,
    password: String,
    session: Mutex<Option<Session>>,
    resolved_handles: Mutex<HashMap<String, String>>,
}

impl BlueskyPublisher {
    pub fn new(config: &DestinationConfig, password: String) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(concat!("crossposter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            service: config.service.trim_end_matches('/').to_string(),
            identifier: config.identifier.clone(),
            password,
            session: Mutex::new(None),
            resolved_handles: Mutex::new(HashMap::new()),
        })
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service, method)
    }

    /// Reuse the cached session or log in
    async fn session(&self) -> Result<Session, PublishError> {
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }

        debug!("Creating Bluesky session for {}", self.identifier);
        let response = self
            .client
            .post(self.xrpc_url("com.atproto.server.createSession"))
            .json(&CreateSessionRequest {
                identifier: &self.identifier,
                password: &self.password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }

        let session: Session = response.json().await?;
        info!("Authenticated to Bluesky as {}", session.did);
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Look up the DID behind a handle; `None` when it does not resolve
    async fn resolve_handle(&self, handle: &str) -> Option<String> {
        if let Some(did) = self.resolved_handles.lock().await.get(handle) {
            return Some(did.clone());
        }

        let response = match self
            .client
            .get(self.xrpc_url("com.atproto.identity.resolveHandle"))
            .query(&[("handle", handle)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to resolve handle {}: {}", handle, e);
                return None;
            }
        };

        if !response.status().is_success() {
            debug!("Handle {} did not resolve: HTTP {}", handle, response.status());
            return None;
        }

        match response.json::<ResolveHandleResponse>().await {
            Ok(resolved) => {
                self.resolved_handles
                    .lock()
                    .await
                    .insert(handle.to_string(), resolved.did.clone());
                Some(resolved.did)
            }
            Err(e) => {
                warn!("Unexpected resolveHandle response for {}: {}", handle, e);
                None
            }
        }
    }

    /// Links and tags, plus mentions whose handles resolve
    async fn build_facets(&self, text: &str) -> Vec<Facet> {
        let mut facets = detect_facets(text);

        for mention in detect_mentions(text) {
            match self.resolve_handle(&mention.handle).await {
                Some(did) => facets.push(mention.into_facet(did)),
                None => debug!("Leaving @{} as plain text", mention.handle),
            }
        }

        sort_facets(&mut facets);
        facets
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Map a failed XRPC response onto the publish error taxonomy
    async fn classify(response: reqwest::Response) -> PublishError {
        let status = response.status().as_u16();
        let body: XrpcError = response.json().await.unwrap_or_default();
        let detail = match (body.error, body.message) {
            (Some(error), Some(message)) => format!("{}: {}", error, message),
            (Some(error), None) => error,
            (None, Some(message)) => message,
            (None, None) => format!("HTTP {}", status),
        };

        match status {
            401 | 403 => PublishError::Auth(detail),
            429 => PublishError::RateLimit(detail),
            400 if detail.starts_with("ExpiredToken") || detail.starts_with("InvalidToken") => {
                PublishError::Auth(detail)
            }
            400 => PublishError::Validation(detail),
            _ => PublishError::Transport(detail),
        }
    }
}

#[async_trait]
impl Publisher for BlueskyPublisher {
    async fn publish(&self, text: &str) -> Result<PostId, PublishError> {
        let session = self.session().await?;
        let facets = self.build_facets(text).await;
        debug!(
            "Detected {} facets: {:?}",
            facets.len(),
            facets
                .iter()
                .flat_map(|f| f.features.iter().map(|feature| feature.type_name()))
                .collect::<Vec<_>>()
        );

        let request = CreateRecordRequest {
            repo: &session.did,
            collection: POST_COLLECTION,
            record: PostRecord {
                kind: POST_COLLECTION,
                text,
                created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                facets,
            },
        };

        let response = self
            .client
            .post(self.xrpc_url("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::classify(response).await;
            if matches!(err, PublishError::Auth(_)) {
                warn!("Bluesky session rejected, will log in again on next publish");
                self.invalidate_session().await;
            }
            return Err(err);
        }

        let created: CreateRecordResponse = response.json().await?;
        info!("Posted to Bluesky: {}", created.uri);
        Ok(created.uri)
    }
}

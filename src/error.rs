//! Error taxonomy for the crossposting core
//!
//! None of these errors are fatal to the process. Each one maps to a recovery
//! rule applied by [`crate::cycle::CrosspostCycle`]:
//!
//! - [`FetchError`]: skip the cycle, leave the watermark untouched
//! - [`PublishError`]: skip that one post, keep going
//! - [`PersistenceError`]: keep the in-memory watermark, log and carry on

use std::time::Duration;
use thiserror::Error;

/// Failure retrieving the source feed
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching feed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("feed responded with HTTP {status}")]
    Status { status: u16 },

    #[error("could not parse feed: {0}")]
    Parse(String),

    #[error("feed fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure handing one message to the destination
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited by destination: {0}")]
    RateLimit(String),

    #[error("destination rejected the post: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        PublishError::Transport(err.to_string())
    }
}

/// Failure reading or writing the persisted watermark
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("watermark I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watermark database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored watermark is not a valid integer: {0:?}")]
    Corrupt(String),
}

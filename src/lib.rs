//! Crossposter - Mastodon to Bluesky mirroring daemon
//!
//! Crossposter polls a Mastodon account's ActivityPub outbox and republishes
//! new posts on Bluesky, oldest first, without duplicating or reordering
//! them across restarts.
//!
//! ## Core Features
//!
//! - **Filtering**: Only new notes, top-level or self-replies, are mirrored
//! - **Formatting**: HTML flattened to plain text, truncated, permalink appended
//! - **Watermark**: Newest mirrored post persisted to a file or SQLite
//! - **Scheduling**: Fixed-interval daemon with single-flight cycles
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`filter`]: Feed item eligibility and ordering
//! - [`format`]: HTML to destination text
//! - [`watermark`]: Watermark persistence
//! - [`source`]: ActivityPub outbox client
//! - [`publisher`]: Bluesky client and dry-run publisher
//! - [`facets`]: Link and hashtag facets for Bluesky rich text
//! - [`cycle`]: The fetch/publish/persist cycle
//! - [`daemon`]: Interval scheduling and process management

pub mod config;
pub mod cycle;
pub mod daemon;
pub mod error;
pub mod facets;
pub mod filter;
pub mod format;
pub mod post;
pub mod publisher;
pub mod source;
pub mod watermark;

pub use config::Config;
pub use cycle::{CrosspostCycle, CycleOutcome, CycleReport};
pub use daemon::Daemon;
pub use error::{FetchError, PersistenceError, PublishError};
pub use post::{EligiblePost, RawPost};
pub use publisher::{BlueskyPublisher, DryRunPublisher, PostId, Publisher};
pub use source::{FeedFetcher, OutboxFetcher};
pub use watermark::{FileBackend, SqliteBackend, WatermarkBackend, WatermarkStore};

//! Crossposting cycle - fetch, filter, format, publish, persist
//!
//! One [`CrosspostCycle`] owns the in-memory watermark for the life of the
//! process. Each call to [`CrosspostCycle::run`] is one pass over the latest
//! feed page. Cycles never overlap: a trigger that arrives while another
//! cycle is in flight is skipped.

use crate::config::Config;
use crate::error::{FetchError, PublishError};
use crate::filter::filter_posts;
use crate::format::format_post;
use crate::post::EligiblePost;
use crate::publisher::{BlueskyPublisher, DryRunPublisher, Publisher};
use crate::source::{FeedFetcher, OutboxFetcher};
use crate::watermark::{FileBackend, SqliteBackend, WatermarkBackend, WatermarkStore};
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// All eligible posts were evaluated
    Completed,
    /// The feed could not be read; nothing was published
    FetchFailed(String),
    /// A fetch or publish call exceeded the call timeout; cycle abandoned
    TimedOut,
    /// Another cycle was still running
    Skipped,
}

/// Results from one crossposting cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub eligible_posts: usize,
    pub published: usize,
    pub failed: usize,
    pub watermark: i64,
    pub persisted: bool,
    pub duration: Duration,
}

/// A post as it would be published, for previews
#[derive(Debug, Clone)]
pub struct PreviewEntry {
    pub post: EligiblePost,
    pub text: String,
    pub is_new: bool,
}

pub struct CrosspostCycle {
    fetcher: Arc<dyn FeedFetcher>,
    publisher: Arc<dyn Publisher>,
    store: WatermarkStore,
    source_prefix: String,
    call_timeout: Duration,
    watermark: AtomicI64,
    running: Mutex<()>,
}

impl CrosspostCycle {
    /// Create a cycle, loading the persisted watermark into memory
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        publisher: Arc<dyn Publisher>,
        store: WatermarkStore,
        source_prefix: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        let watermark = store.load();

        Self {
            fetcher,
            publisher,
            store,
            source_prefix: source_prefix.into(),
            call_timeout,
            watermark: AtomicI64::new(watermark),
            running: Mutex::new(()),
        }
    }

    /// Wire up the outbox fetcher, publisher and watermark store from config
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let fetcher =
            OutboxFetcher::new(&config.source).context("Failed to create outbox fetcher")?;

        let publisher: Arc<dyn Publisher> = if config.sync.dry_run {
            info!("Dry run enabled, nothing will be posted");
            Arc::new(DryRunPublisher)
        } else {
            let password = config.destination_password()?;
            Arc::new(
                BlueskyPublisher::new(&config.destination, password)
                    .context("Failed to create Bluesky publisher")?,
            )
        };

        let store = open_watermark_store(config)?;

        Ok(Self::new(
            Arc::new(fetcher),
            publisher,
            store,
            config.source.user_prefix(),
            config.call_timeout(),
        ))
    }

    /// Current in-memory watermark
    pub fn watermark(&self) -> i64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Run one cycle. Never fails; the outcome is in the report.
    pub async fn run(&self) -> CycleReport {
        let start = Instant::now();

        let Ok(_running) = self.running.try_lock() else {
            warn!("Previous cycle still running, skipping this trigger");
            return self.report(CycleOutcome::Skipped, start);
        };

        info!("Checking for new posts");

        let raw_posts = match timeout(self.call_timeout, self.fetcher.fetch_recent_posts()).await {
            Ok(Ok(posts)) => posts,
            Ok(Err(e)) => {
                warn!("Failed to fetch feed, skipping cycle: {}", e);
                return self.report(CycleOutcome::FetchFailed(e.to_string()), start);
            }
            Err(_) => {
                warn!(
                    "{}, abandoning cycle",
                    FetchError::Timeout(self.call_timeout)
                );
                return self.report(CycleOutcome::TimedOut, start);
            }
        };

        let eligible = filter_posts(&raw_posts, &self.source_prefix);
        let current = self.watermark();

        let mut report = self.report(CycleOutcome::Completed, start);
        report.eligible_posts = eligible.len();

        let mut observed_max = 0i64;
        let mut seen_urls = HashSet::new();

        for entry in &eligible {
            observed_max = observed_max.max(entry.sort_key);

            if entry.sort_key <= current {
                continue;
            }
            if !seen_urls.insert(entry.post.url.as_str()) {
                debug!(url = %entry.post.url, "Duplicate feed item, already handled this cycle");
                continue;
            }

            info!(post = entry.sort_key, url = %entry.post.url, "Found new post");
            let text = format_post(&entry.post);

            match timeout(self.call_timeout, self.publisher.publish(&text)).await {
                Ok(Ok(post_id)) => {
                    debug!(post = entry.sort_key, "Published as {}", post_id);
                    report.published += 1;
                }
                Ok(Err(e)) => {
                    error!(post = entry.sort_key, url = %entry.post.url, "Failed to publish: {}", e);
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        post = entry.sort_key,
                        "{}, abandoning cycle without advancing watermark",
                        PublishError::Timeout(self.call_timeout)
                    );
                    report.outcome = CycleOutcome::TimedOut;
                    report.duration = start.elapsed();
                    return report;
                }
            }
        }

        if observed_max > 0 {
            // Never regress, even if the newest post on the page is older
            let next = current.max(observed_max);
            self.watermark.store(next, Ordering::SeqCst);
            report.watermark = next;
            report.persisted = self.store.save(next);
        }

        report.duration = start.elapsed();
        info!(
            "Cycle completed in {:.2}s: {} eligible, {} published, {} failed, watermark {}",
            report.duration.as_secs_f64(),
            report.eligible_posts,
            report.published,
            report.failed,
            report.watermark
        );

        report
    }

    /// Fetch, filter and format without publishing or touching the watermark
    pub async fn preview(&self) -> Result<Vec<PreviewEntry>> {
        let raw_posts = timeout(self.call_timeout, self.fetcher.fetch_recent_posts())
            .await
            .map_err(|_| FetchError::Timeout(self.call_timeout))??;

        let current = self.watermark();
        Ok(filter_posts(&raw_posts, &self.source_prefix)
            .into_iter()
            .map(|post| PreviewEntry {
                text: format_post(&post.post),
                is_new: post.sort_key > current,
                post,
            })
            .collect())
    }

    fn report(&self, outcome: CycleOutcome, start: Instant) -> CycleReport {
        CycleReport {
            outcome,
            eligible_posts: 0,
            published: 0,
            failed: 0,
            watermark: self.watermark(),
            persisted: false,
            duration: start.elapsed(),
        }
    }
}

/// Open the configured watermark backend
pub fn open_watermark_store(config: &Config) -> Result<WatermarkStore> {
    let path = Path::new(&config.state.path);
    let backend: Box<dyn WatermarkBackend> = match config.state.backend.as_str() {
        "file" => Box::new(FileBackend::new(path)),
        "sqlite" => Box::new(
            SqliteBackend::open_at(path)
                .with_context(|| format!("Failed to open watermark database {:?}", path))?,
        ),
        other => return Err(anyhow!("Unknown state backend: {}", other)),
    };
    Ok(WatermarkStore::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::post::RawPost;
    use crate::source::MockFeedFetcher;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    const PREFIX: &str = "https://social.example/users/alice";

    fn note(millis: i64, content: &str) -> RawPost {
        let published = chrono::DateTime::from_timestamp_millis(millis)
            .unwrap()
            .to_rfc3339();
        RawPost {
            activity_type: "Create".to_string(),
            object_type: "Note".to_string(),
            content: content.to_string(),
            url: format!("https://ex/{}", millis),
            published_at: published,
            in_reply_to: None,
        }
    }

    fn fetcher_returning(feed: Vec<RawPost>) -> Arc<dyn FeedFetcher> {
        let mut fetcher = MockFeedFetcher::new();
        fetcher
            .expect_fetch_recent_posts()
            .returning(move || Ok(feed.clone()));
        Arc::new(fetcher)
    }

    #[derive(Default)]
    struct RecordingPublisher {
        texts: StdMutex<Vec<String>>,
        reject_containing: Option<String>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, text: &str) -> Result<String, PublishError> {
            if let Some(needle) = &self.reject_containing {
                if text.contains(needle.as_str()) {
                    return Err(PublishError::RateLimit("slow down".to_string()));
                }
            }
            let mut texts = self.texts.lock().unwrap();
            texts.push(text.to_string());
            Ok(format!("at://post/{}", texts.len()))
        }
    }

    impl RecordingPublisher {
        fn published(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct MemoryBackend {
        value: Arc<StdMutex<Option<i64>>>,
        writes: Arc<StdMutex<Vec<i64>>>,
        fail_writes: bool,
    }

    impl WatermarkBackend for MemoryBackend {
        fn read(&self) -> Result<Option<i64>, PersistenceError> {
            Ok(*self.value.lock().unwrap())
        }

        fn write(&self, value: i64) -> Result<(), PersistenceError> {
            if self.fail_writes {
                return Err(PersistenceError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only",
                )));
            }
            *self.value.lock().unwrap() = Some(value);
            self.writes.lock().unwrap().push(value);
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn backend_at(value: Option<i64>) -> MemoryBackend {
        let backend = MemoryBackend::default();
        *backend.value.lock().unwrap() = value;
        backend
    }

    fn cycle(
        fetcher: Arc<dyn FeedFetcher>,
        publisher: Arc<RecordingPublisher>,
        backend: &MemoryBackend,
    ) -> CrosspostCycle {
        CrosspostCycle::new(
            fetcher,
            publisher,
            WatermarkStore::new(Box::new(backend.clone())),
            PREFIX,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_first_post_published_and_watermark_saved() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(None);
        let cycle = cycle(
            fetcher_returning(vec![note(1000, "<p>Hello</p>")]),
            publisher.clone(),
            &backend,
        );
        assert_eq!(cycle.watermark(), 0);

        let report = cycle.run().await;

        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(publisher.published(), vec!["Hello https://ex/1000".to_string()]);
        assert_eq!(report.watermark, 1000);
        assert!(report.persisted);
        assert_eq!(*backend.writes.lock().unwrap(), vec![1000]);
    }

    #[tokio::test]
    async fn test_unchanged_feed_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(1000));
        let cycle = cycle(
            fetcher_returning(vec![note(1000, "<p>Hello</p>")]),
            publisher.clone(),
            &backend,
        );

        let report = cycle.run().await;

        assert_eq!(report.eligible_posts, 1);
        assert_eq!(report.published, 0);
        assert!(publisher.published().is_empty());
        assert_eq!(cycle.watermark(), 1000);
        // same value rewritten
        assert_eq!(*backend.writes.lock().unwrap(), vec![1000]);
    }

    #[tokio::test]
    async fn test_publishes_oldest_first() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(500));
        let feed = vec![note(3000, "three"), note(2000, "two"), note(1000, "one")];
        let cycle = cycle(fetcher_returning(feed), publisher.clone(), &backend);

        cycle.run().await;

        assert_eq!(
            publisher.published(),
            vec![
                "one https://ex/1000".to_string(),
                "two https://ex/2000".to_string(),
                "three https://ex/3000".to_string(),
            ]
        );
        assert_eq!(cycle.watermark(), 3000);
    }

    #[tokio::test]
    async fn test_only_posts_newer_than_watermark() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(2000));
        let feed = vec![note(3000, "three"), note(2000, "two"), note(1000, "one")];
        let cycle = cycle(fetcher_returning(feed), publisher.clone(), &backend);

        let report = cycle.run().await;

        assert_eq!(publisher.published(), vec!["three https://ex/3000".to_string()]);
        assert_eq!(report.eligible_posts, 3);
        assert_eq!(report.watermark, 3000);
    }

    #[tokio::test]
    async fn test_filtered_posts_never_published() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(None);

        let mut edit = note(3000, "edited");
        edit.activity_type = "Update".to_string();
        let mut foreign_reply = note(2000, "reply");
        foreign_reply.in_reply_to = Some("https://other.example/users/bob/statuses/1".to_string());

        let cycle = cycle(
            fetcher_returning(vec![edit, foreign_reply, note(1000, "mine")]),
            publisher.clone(),
            &backend,
        );
        let report = cycle.run().await;

        assert_eq!(publisher.published(), vec!["mine https://ex/1000".to_string()]);
        // ineligible posts do not move the watermark
        assert_eq!(report.watermark, 1000);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_block_advance() {
        let publisher = Arc::new(RecordingPublisher {
            reject_containing: Some("two".to_string()),
            ..Default::default()
        });
        let backend = backend_at(None);
        let feed = vec![note(3000, "three"), note(2000, "two"), note(1000, "one")];
        let cycle = cycle(fetcher_returning(feed), publisher.clone(), &backend);

        let report = cycle.run().await;

        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(
            publisher.published(),
            vec!["one https://ex/1000".to_string(), "three https://ex/3000".to_string()]
        );
        assert_eq!(report.watermark, 3000);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_cycle() {
        let mut fetcher = MockFeedFetcher::new();
        fetcher
            .expect_fetch_recent_posts()
            .times(1)
            .returning(|| Err(FetchError::Status { status: 502 }));

        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(1000));
        let cycle = cycle(Arc::new(fetcher), publisher.clone(), &backend);

        let report = cycle.run().await;

        assert!(matches!(report.outcome, CycleOutcome::FetchFailed(_)));
        assert_eq!(cycle.watermark(), 1000);
        assert!(backend.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_feed_leaves_watermark_untouched() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(1000));
        let cycle = cycle(fetcher_returning(Vec::new()), publisher.clone(), &backend);

        let report = cycle.run().await;

        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.watermark, 1000);
        assert!(!report.persisted);
        assert!(backend.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(5000));
        let cycle = cycle(
            fetcher_returning(vec![note(1000, "old")]),
            publisher.clone(),
            &backend,
        );

        cycle.run().await;

        assert_eq!(cycle.watermark(), 5000);
        assert_eq!(*backend.writes.lock().unwrap(), vec![5000]);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_memory_watermark() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = MemoryBackend {
            fail_writes: true,
            ..Default::default()
        };
        let feed = vec![note(1000, "one")];
        let cycle = cycle(fetcher_returning(feed), publisher.clone(), &backend);

        let report = cycle.run().await;
        assert!(!report.persisted);
        assert_eq!(cycle.watermark(), 1000);

        // memory copy is authoritative: second run does not republish
        cycle.run().await;
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_feed_items_published_once() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(None);
        let item = note(1000, "dup");
        let cycle = cycle(
            fetcher_returning(vec![item.clone(), item]),
            publisher.clone(),
            &backend,
        );

        cycle.run().await;
        assert_eq!(publisher.published().len(), 1);
    }

    struct SlowFetcher {
        delay: Duration,
        feed: Vec<RawPost>,
    }

    #[async_trait]
    impl FeedFetcher for SlowFetcher {
        async fn fetch_recent_posts(&self) -> Result<Vec<RawPost>, FetchError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.feed.clone())
        }
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(None);
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_millis(200),
            feed: vec![note(1000, "one")],
        });
        let cycle = cycle(fetcher, publisher.clone(), &backend);

        let (first, second) = tokio::join!(cycle.run(), cycle.run());

        assert_eq!(first.outcome, CycleOutcome::Completed);
        assert_eq!(second.outcome, CycleOutcome::Skipped);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_hanging_fetch_abandons_cycle() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(1000));
        let fetcher = Arc::new(SlowFetcher {
            delay: Duration::from_secs(10),
            feed: vec![note(2000, "late")],
        });
        let cycle = CrosspostCycle::new(
            fetcher,
            publisher.clone(),
            WatermarkStore::new(Box::new(backend.clone())),
            PREFIX,
            Duration::from_millis(50),
        );

        let report = cycle.run().await;

        assert_eq!(report.outcome, CycleOutcome::TimedOut);
        assert_eq!(cycle.watermark(), 1000);
        assert!(publisher.published().is_empty());
    }

    struct HangingPublisher;

    #[async_trait]
    impl Publisher for HangingPublisher {
        async fn publish(&self, _text: &str) -> Result<String, PublishError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("never".to_string())
        }
    }

    #[tokio::test]
    async fn test_hanging_publish_abandons_cycle_without_advance() {
        let backend = backend_at(Some(500));
        let cycle = CrosspostCycle::new(
            fetcher_returning(vec![note(1000, "one")]),
            Arc::new(HangingPublisher),
            WatermarkStore::new(Box::new(backend.clone())),
            PREFIX,
            Duration::from_millis(50),
        );

        let report = cycle.run().await;

        assert_eq!(report.outcome, CycleOutcome::TimedOut);
        assert_eq!(cycle.watermark(), 500);
        assert!(backend.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preview_marks_new_posts() {
        let publisher = Arc::new(RecordingPublisher::default());
        let backend = backend_at(Some(1500));
        let cycle = cycle(
            fetcher_returning(vec![note(2000, "two"), note(1000, "one")]),
            publisher.clone(),
            &backend,
        );

        let entries = cycle.preview().await.unwrap();

        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_new);
        assert!(entries[1].is_new);
        assert_eq!(entries[1].text, "two https://ex/2000");
        assert!(publisher.published().is_empty());
        assert!(backend.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_state_backend() {
        let mut config = Config::default();
        config.state.backend = "redis".to_string();
        assert!(open_watermark_store(&config).is_err());
    }
}

//! Post filtering - selects which feed items are eligible for mirroring
//!
//! Only newly created notes survive, and only if they are top-level posts or
//! replies inside the author's own threads. The result is oldest first.

use crate::post::{EligiblePost, RawPost, ACTIVITY_CREATE, OBJECT_NOTE};
use tracing::{debug, warn};

/// Filter a newest-first feed page down to eligible posts, oldest first.
///
/// Reply scope uses a plain string prefix check against `source_user_prefix`,
/// so `https://host/users/alice2/...` also matches `https://host/users/alice`.
pub fn filter_posts(raw_posts: &[RawPost], source_user_prefix: &str) -> Vec<EligiblePost> {
    let mut eligible: Vec<EligiblePost> = raw_posts
        .iter()
        .filter(|post| is_new_note(post))
        .filter(|post| is_in_scope(post, source_user_prefix))
        .filter_map(|post| match post.sort_key() {
            Some(sort_key) => Some(EligiblePost {
                post: post.clone(),
                sort_key,
            }),
            None => {
                warn!(
                    url = %post.url,
                    published = %post.published_at,
                    "Dropping post with unparseable timestamp"
                );
                None
            }
        })
        .collect();

    eligible.reverse();

    debug!(
        "Filtered {} feed items to {} eligible posts",
        raw_posts.len(),
        eligible.len()
    );

    eligible
}

/// Edits, boosts and non-text objects are never mirrored
fn is_new_note(post: &RawPost) -> bool {
    post.activity_type == ACTIVITY_CREATE && post.object_type == OBJECT_NOTE
}

fn is_in_scope(post: &RawPost, source_user_prefix: &str) -> bool {
    match &post.in_reply_to {
        None => true,
        Some(parent) => parent.starts_with(source_user_prefix),
    }
}

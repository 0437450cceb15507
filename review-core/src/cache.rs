//! In-memory index of review requests still inside their cancellation window.
//!
//! An entry's presence is what makes a `Pending` request cancellable. Every
//! operation holds the lock only for the map access itself; callers must never
//! hold it across I/O, and the API makes that impossible by not exposing the guard.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::model::{ReviewRequestId, SubmissionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCacheEntry {
    pub review_request_id: ReviewRequestId,
    pub submission_id: SubmissionId,
    pub expires_at: Instant,
}

impl PendingCacheEntry {
    fn is_live_at(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Concurrency-safe pending-window index.
///
/// `add`, `remove`, `claim_live`, `reinsert` and `drain_expired` take the write lock;
/// lookups share the read lock. Removal is linearizable: of two racing claims on
/// the same id exactly one observes the entry.
#[derive(Debug, Default)]
pub struct PendingReviewCache {
    entries: RwLock<HashMap<ReviewRequestId, PendingCacheEntry>>,
}

impl PendingReviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `id`, expiring `ttl` from now.
    pub async fn add(&self, id: ReviewRequestId, submission_id: SubmissionId, ttl: Duration) {
        let entry = PendingCacheEntry {
            review_request_id: id,
            submission_id,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(id, entry);
    }

    /// Put back an entry previously claimed, keeping its original expiry.
    pub async fn reinsert(&self, entry: PendingCacheEntry) {
        self.entries
            .write()
            .await
            .insert(entry.review_request_id, entry);
    }

    /// Remove the entry regardless of expiry. Returns whether it existed.
    pub async fn remove(&self, id: ReviewRequestId) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    /// Remove and return the entry only while its window is still open.
    ///
    /// An entry whose window has closed is left in place for `drain_expired`.
    pub async fn claim_live(&self, id: ReviewRequestId) -> Option<PendingCacheEntry> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let live = entries.get(&id).is_some_and(|entry| entry.is_live_at(now));
        if live {
            entries.remove(&id)
        } else {
            None
        }
    }

    pub async fn get(&self, id: ReviewRequestId) -> Option<PendingCacheEntry> {
        self.entries.read().await.get(&id).copied()
    }

    /// Whether `id` can still be cancelled.
    pub async fn exists(&self, id: ReviewRequestId) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(&id)
            .is_some_and(|entry| entry.is_live_at(now))
    }

    /// Time left in the window; zero when absent or already expired.
    pub async fn time_remaining(&self, id: ReviewRequestId) -> Duration {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.expires_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Atomically remove and return every entry whose window has closed.
    ///
    /// This is the only place expiry becomes observable; the entries returned are
    /// claimed by the caller and by nobody else.
    pub async fn drain_expired(&self) -> Vec<PendingCacheEntry> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let expired: Vec<ReviewRequestId> = entries
            .values()
            .filter(|entry| !entry.is_live_at(now))
            .map(|entry| entry.review_request_id)
            .collect();

        let mut drained: Vec<PendingCacheEntry> = expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect();
        drained.sort_by_key(|entry| entry.expires_at);
        drained
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn id(n: u64) -> ReviewRequestId {
        ReviewRequestId(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_remaining_counts_down_to_zero() {
        let cache = PendingReviewCache::new();
        cache.add(id(1), SubmissionId(42), WINDOW).await;

        let first = cache.time_remaining(id(1)).await;
        assert_eq!(first, WINDOW);

        tokio::time::advance(Duration::from_secs(60)).await;
        let second = cache.time_remaining(id(1)).await;
        assert!(second < first);
        assert_eq!(second, WINDOW - Duration::from_secs(60));

        tokio::time::advance(WINDOW).await;
        assert_eq!(cache.time_remaining(id(1)).await, Duration::ZERO);
        assert!(!cache.exists(id(1)).await);
        // Closed but not yet drained.
        assert!(cache.get(id(1)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_entry_has_no_time() {
        let cache = PendingReviewCache::new();
        assert_eq!(cache.time_remaining(id(7)).await, Duration::ZERO);
        assert!(!cache.exists(id(7)).await);
        assert!(cache.get(id(7)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_overwrites_expiry() {
        let cache = PendingReviewCache::new();
        cache.add(id(1), SubmissionId(42), Duration::from_secs(10)).await;
        cache.add(id(1), SubmissionId(42), WINDOW).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.time_remaining(id(1)).await, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_reports_existence_once() {
        let cache = PendingReviewCache::new();
        cache.add(id(1), SubmissionId(42), WINDOW).await;
        assert!(cache.remove(id(1)).await);
        assert!(!cache.remove(id(1)).await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_live_leaves_closed_entries_for_the_drain() {
        let cache = PendingReviewCache::new();
        cache.add(id(1), SubmissionId(42), WINDOW).await;
        tokio::time::advance(WINDOW).await;

        assert!(cache.claim_live(id(1)).await.is_none());
        let drained = cache.drain_expired().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].review_request_id, id(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinsert_keeps_original_expiry() {
        let cache = PendingReviewCache::new();
        cache.add(id(1), SubmissionId(42), WINDOW).await;
        let entry = cache.claim_live(id(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        cache.reinsert(entry).await;
        assert_eq!(
            cache.time_remaining(id(1)).await,
            WINDOW - Duration::from_secs(120)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_only_expired_entries() {
        let cache = PendingReviewCache::new();
        cache.add(id(1), SubmissionId(1), Duration::from_secs(30)).await;
        cache.add(id(2), SubmissionId(2), Duration::from_secs(10)).await;
        cache.add(id(3), SubmissionId(3), WINDOW).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let drained = cache.drain_expired().await;
        let ids: Vec<_> = drained.iter().map(|e| e.review_request_id).collect();
        assert_eq!(ids, vec![id(2), id(1)]);

        assert!(cache.drain_expired().await.is_empty());
        assert!(cache.exists(id(3)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_and_drain_race_has_one_winner() {
        let cache = Arc::new(PendingReviewCache::new());
        for n in 0..64 {
            cache.add(id(n), SubmissionId(n), Duration::from_secs(5)).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        let claimers: Vec<_> = (0..64)
            .map(|n| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.remove(id(n)).await })
            })
            .collect();
        let drainer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.drain_expired().await })
        };

        let mut removed = 0;
        for claimer in claimers {
            if claimer.await.unwrap() {
                removed += 1;
            }
        }
        let drained = drainer.await.unwrap().len();
        assert_eq!(removed + drained, 64);
        assert!(cache.is_empty().await);
    }

    proptest! {
        #[test]
        fn prop_drain_never_returns_live_entries(
            ttls in proptest::collection::vec(0u64..120, 1..40),
            elapsed in 0u64..120,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let cache = PendingReviewCache::new();
                for (n, ttl) in ttls.iter().enumerate() {
                    cache
                        .add(id(n as u64), SubmissionId(n as u64), Duration::from_secs(*ttl))
                        .await;
                }
                tokio::time::advance(Duration::from_secs(elapsed)).await;

                let drained = cache.drain_expired().await;
                let expected = ttls.iter().filter(|ttl| **ttl <= elapsed).count();
                prop_assert_eq!(drained.len(), expected);
                for entry in &drained {
                    prop_assert!(entry.expires_at <= Instant::now());
                }
                prop_assert_eq!(cache.len().await, ttls.len() - expected);
                Ok(())
            })?;
        }
    }
}

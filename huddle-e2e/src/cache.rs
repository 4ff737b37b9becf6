//! Session key cache: unwrapped channel keys for the lifetime of one session.
//!
//! Concurrent lookups for the same uncached channel share one unwrap. A blob
//! that failed to unwrap is remembered, and the same blob is not unwrapped
//! again until the grant changes or the session ends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::backend::GrantStore;
use crate::crypto::{ChannelKey, KeyUnwrapper, WrappedKey};
use crate::error::{E2eError, Result};

/// Result of one unwrap attempt, carrying the blob that was tried.
type Attempt = std::result::Result<ChannelKey, (E2eError, Option<WrappedKey>)>;

type InFlight = Shared<BoxFuture<'static, Attempt>>;

enum Slot {
    Ready(ChannelKey),
    InFlight(InFlight),
    Failed { wrapped: WrappedKey, error: E2eError },
}

/// Per-session map of `channel_id -> unwrapped key`. Never persisted.
pub struct SessionKeyCache {
    user_id: String,
    grants: Arc<dyn GrantStore>,
    unwrapper: Arc<dyn KeyUnwrapper>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionKeyCache {
    pub fn new(
        user_id: impl Into<String>,
        grants: Arc<dyn GrantStore>,
        unwrapper: Arc<dyn KeyUnwrapper>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            grants,
            unwrapper,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel key for `channel_id`, unwrapping this user's grant on a miss.
    pub async fn get_or_unwrap(&self, channel_id: &str) -> Result<ChannelKey> {
        let grants = Arc::clone(&self.grants);
        let channel = channel_id.to_string();
        let user = self.user_id.clone();

        self.get_or_unwrap_with(channel_id, move || async move {
            grants.get_grant(&channel, &user).await
        })
        .await
    }

    /// Like [`SessionKeyCache::get_or_unwrap`] with a caller-supplied grant fetch.
    ///
    /// `fetch_grant` only runs when this call starts a new unwrap; callers
    /// joining an in-flight unwrap wait for its result instead.
    pub async fn get_or_unwrap_with<F, Fut>(&self, channel_id: &str, fetch_grant: F) -> Result<ChannelKey>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<WrappedKey>>> + Send + 'static,
    {
        let in_flight = {
            let mut slots = self.slots();
            let joined = match slots.get(channel_id) {
                Some(Slot::Ready(key)) => return Ok(key.clone()),
                Some(Slot::InFlight(pending)) => Some(pending.clone()),
                _ => None,
            };

            match joined {
                Some(pending) => pending,
                None => {
                    let remembered = match slots.remove(channel_id) {
                        Some(Slot::Failed { wrapped, error }) => Some((wrapped, error)),
                        _ => None,
                    };
                    let pending = self.start_unwrap(channel_id, fetch_grant, remembered);
                    slots.insert(channel_id.to_string(), Slot::InFlight(pending.clone()));
                    pending
                }
            }
        };

        let attempt = in_flight.clone().await;
        self.settle(channel_id, &in_flight, &attempt);
        attempt.map_err(|(error, _)| error)
    }

    fn start_unwrap<F, Fut>(
        &self,
        channel_id: &str,
        fetch_grant: F,
        remembered: Option<(WrappedKey, E2eError)>,
    ) -> InFlight
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<WrappedKey>>> + Send + 'static,
    {
        let unwrapper = Arc::clone(&self.unwrapper);
        let channel_id = channel_id.to_string();
        let user_id = self.user_id.clone();

        // Spawned so the unwrap finishes even if every waiter goes away.
        let task = tokio::spawn(async move {
            let wrapped = match fetch_grant().await {
                Ok(Some(wrapped)) => wrapped,
                Ok(None) => return Err((E2eError::missing_grant(&channel_id, &user_id), None)),
                Err(e) => return Err((e, None)),
            };

            if let Some((failed, error)) = remembered {
                if failed == wrapped {
                    debug!(channel_id = %channel_id, "Grant unchanged since failed unwrap, not retrying");
                    return Err((error, Some(wrapped)));
                }
            }

            match unwrapper.unwrap_key(&wrapped).await {
                Ok(key) => Ok(key),
                Err(e) => {
                    warn!(channel_id = %channel_id, user_id = %user_id, error = %e, "Failed to unwrap channel key");
                    Err((e, Some(wrapped)))
                }
            }
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err((E2eError::Backend(format!("unwrap task failed: {e}")), None))
            })
        }
        .boxed()
        .shared()
    }

    /// Replace the in-flight slot with its outcome, unless it was cleared or
    /// replaced in the meantime.
    fn settle(&self, channel_id: &str, in_flight: &InFlight, attempt: &Attempt) {
        let mut slots = self.slots();
        let still_ours = matches!(
            slots.get(channel_id),
            Some(Slot::InFlight(pending)) if pending.ptr_eq(in_flight)
        );
        if !still_ours {
            return;
        }

        match attempt {
            Ok(key) => {
                slots.insert(channel_id.to_string(), Slot::Ready(key.clone()));
            }
            Err((error, Some(wrapped))) if is_permanent(error) => {
                slots.insert(
                    channel_id.to_string(),
                    Slot::Failed {
                        wrapped: wrapped.clone(),
                        error: error.clone(),
                    },
                );
            }
            Err(_) => {
                slots.remove(channel_id);
            }
        }
    }

    /// Seed the cache with a key this session already holds (e.g. just provisioned).
    pub fn insert(&self, channel_id: &str, key: ChannelKey) {
        self.slots().insert(channel_id.to_string(), Slot::Ready(key));
    }

    /// Drop every key. Called at session end.
    pub fn clear(&self) {
        self.slots().clear();
    }
}

/// Failures that repeat for as long as the blob and local key are unchanged.
fn is_permanent(error: &E2eError) -> bool {
    matches!(
        error,
        E2eError::KeyMismatch | E2eError::InvalidEncoding(_) | E2eError::DecryptionFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Unwrapper that sleeps, counts calls, and accepts only one blob.
    struct CountingUnwrapper {
        calls: AtomicUsize,
        accepts: WrappedKey,
        key: ChannelKey,
    }

    impl CountingUnwrapper {
        fn new(accepts: WrappedKey, key: ChannelKey) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                accepts,
                key,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyUnwrapper for CountingUnwrapper {
        async fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<ChannelKey> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if *wrapped == self.accepts {
                Ok(self.key.clone())
            } else {
                Err(E2eError::KeyMismatch)
            }
        }
    }

    fn blob(byte: u8) -> WrappedKey {
        WrappedKey::from_bytes(vec![byte; 4])
    }

    async fn setup() -> (Arc<MemoryBackend>, Arc<CountingUnwrapper>, SessionKeyCache, ChannelKey) {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_grant("general", "alice", &blob(1)).await.unwrap();
        let key = ChannelKey::generate();
        let unwrapper = CountingUnwrapper::new(blob(1), key.clone());
        let cache = SessionKeyCache::new("alice", backend.clone(), unwrapper.clone());
        (backend, unwrapper, cache, key)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_unwrap() {
        let (backend, unwrapper, cache, key) = setup().await;
        let cache = Arc::new(cache);

        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_unwrap("general").await })
            })
            .collect();

        for lookup in lookups {
            assert_eq!(lookup.await.unwrap().unwrap(), key);
        }
        assert_eq!(unwrapper.calls(), 1);
        assert_eq!(backend.grant_reads(), 1);
    }

    #[tokio::test]
    async fn test_hit_skips_grant_fetch_and_unwrap() {
        let (backend, unwrapper, cache, key) = setup().await;

        assert_eq!(cache.get_or_unwrap("general").await.unwrap(), key);
        assert_eq!(cache.get_or_unwrap("general").await.unwrap(), key);

        assert_eq!(unwrapper.calls(), 1);
        assert_eq!(backend.grant_reads(), 1);
    }

    #[tokio::test]
    async fn test_missing_grant_is_not_cached() {
        let (backend, unwrapper, cache, key) = setup().await;

        assert_eq!(
            cache.get_or_unwrap("random").await.unwrap_err(),
            E2eError::missing_grant("random", "alice")
        );
        assert_eq!(unwrapper.calls(), 0);

        backend.put_grant("random", "alice", &blob(1)).await.unwrap();
        assert_eq!(cache.get_or_unwrap("random").await.unwrap(), key);
    }

    #[tokio::test]
    async fn test_failed_blob_is_not_unwrapped_twice() {
        let (backend, unwrapper, cache, key) = setup().await;
        backend.put_grant("general", "alice", &blob(7)).await.unwrap();

        assert_eq!(cache.get_or_unwrap("general").await.unwrap_err(), E2eError::KeyMismatch);
        assert_eq!(cache.get_or_unwrap("general").await.unwrap_err(), E2eError::KeyMismatch);
        assert_eq!(unwrapper.calls(), 1);

        // re-provisioned grant gets a fresh attempt
        backend.put_grant("general", "alice", &blob(1)).await.unwrap();
        assert_eq!(cache.get_or_unwrap("general").await.unwrap(), key);
        assert_eq!(unwrapper.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_waiters_share_failure() {
        let (backend, unwrapper, cache, _key) = setup().await;
        backend.put_grant("general", "alice", &blob(9)).await.unwrap();
        let cache = Arc::new(cache);

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_unwrap("general").await })
            })
            .collect();

        for lookup in lookups {
            assert_eq!(lookup.await.unwrap().unwrap_err(), E2eError::KeyMismatch);
        }
        assert_eq!(unwrapper.calls(), 1);
    }

    #[tokio::test]
    async fn test_clear_forces_fresh_unwrap() {
        let (_backend, unwrapper, cache, key) = setup().await;

        cache.get_or_unwrap("general").await.unwrap();
        cache.clear();

        assert_eq!(cache.get_or_unwrap("general").await.unwrap(), key);
        assert_eq!(unwrapper.calls(), 2);
    }

    #[tokio::test]
    async fn test_seeded_key_needs_no_unwrap() {
        let (_backend, unwrapper, cache, _key) = setup().await;
        let seeded = ChannelKey::generate();

        cache.insert("fresh", seeded.clone());
        assert_eq!(cache.get_or_unwrap("fresh").await.unwrap(), seeded);
        assert_eq!(unwrapper.calls(), 0);
    }

    #[tokio::test]
    async fn test_custom_fetch_runs_once_per_miss() {
        let (_backend, unwrapper, cache, key) = setup().await;
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fetches = fetches.clone();
            let got = cache
                .get_or_unwrap_with("side", move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(blob(1)))
                })
                .await
                .unwrap();
            assert_eq!(got, key);
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(unwrapper.calls(), 1);
    }
}

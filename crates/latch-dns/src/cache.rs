//! The knock cache: memoized DNS answers with single-flight coalescing.
//!
//! Concurrent resolution attempts for the same resource share one loader.
//! The loader runs as an independent task; a waiter that gives up does not
//! cancel it, so a later caller can still observe the result through the
//! cache. Two locks back the structure: a reader-writer lock over the
//! entries and a separate mutex over the in-flight table, always acquired
//! in that order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Ceiling each waiter applies to the shared outcome, independent of the
/// loader's own deadline.
const WAIT_CEILING: Duration = Duration::from_secs(5);

/// How often the janitor sweeps expired entries.
const JANITOR_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("timed out waiting for the in-flight resolution")]
    WaitTimeout,

    #[error("in-flight resolution went away")]
    LoaderGone,
}

struct CacheEntry {
    message: Message,
    expires_at: Instant,
}

/// `None` while the loader runs; the inner option is the loader's outcome.
type Waiting = Option<Option<Message>>;

struct Inner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Waiting>>>,
    cap: Duration,
    wait_ceiling: Duration,
}

#[derive(Clone)]
pub struct KnockCache {
    inner: Arc<Inner>,
}

impl KnockCache {
    /// `cap` bounds every entry's lifetime regardless of the grant.
    pub fn new(cap: Duration) -> Self {
        Self::with_wait_ceiling(cap, WAIT_CEILING)
    }

    fn with_wait_ceiling(cap: Duration, wait_ceiling: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                cap,
                wait_ceiling,
            }),
        }
    }

    /// Non-expired entry for `key`, if any. Expired entries behave as
    /// misses and are left for the janitor.
    pub fn get(&self, key: &str) -> Option<Message> {
        let entries = self.inner.entries.read().unwrap();
        let entry = entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.message.clone())
    }

    /// Overwrite any existing entry. The effective lifetime is
    /// `min(ttl, cap)`; a zero TTL stores nothing.
    pub fn insert(&self, key: &str, message: Message, ttl_secs: u32) {
        if ttl_secs == 0 {
            return;
        }
        self.insert_for(key, message, Duration::from_secs(u64::from(ttl_secs)));
    }

    fn insert_for(&self, key: &str, message: Message, ttl: Duration) {
        let ttl = ttl.min(self.inner.cap);
        let entry = CacheEntry {
            message,
            expires_at: Instant::now() + ttl,
        };
        self.inner
            .entries
            .write()
            .unwrap()
            .insert(key.to_string(), entry);
    }

    /// Return the cached message for `key`, or coalesce concurrent callers
    /// onto one run of `loader`.
    ///
    /// The loader yields `Some((message, ttl))` to cache (for `ttl > 0`)
    /// and return, or `None` for "no answer": returned to every current
    /// waiter but never cached, so the next caller retries.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        loader: F,
    ) -> Result<Option<Message>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<(Message, u32)>> + Send + 'static,
    {
        if let Some(message) = self.get(key) {
            return Ok(Some(message));
        }

        let mut rx = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            match inflight.get(key).cloned() {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx.clone());

                    let cache = self.clone();
                    let key = key.to_string();
                    let fut = loader();
                    tokio::spawn(async move {
                        // The winner of a lost race may find the previous
                        // loader's entry already cached; serve it instead
                        // of knocking again.
                        let outcome = match cache.get(&key) {
                            Some(message) => Some(message),
                            None => {
                                let loaded = fut.await;
                                if let Some((message, ttl)) = &loaded {
                                    cache.insert(&key, message.clone(), *ttl);
                                }
                                loaded.map(|(message, _)| message)
                            }
                        };
                        let _ = tx.send(Some(outcome));
                        cache.inner.inflight.lock().unwrap().remove(&key);
                    });
                    rx
                }
            }
        };

        let wait = rx.wait_for(|outcome| outcome.is_some());
        let result = match tokio::time::timeout(self.inner.wait_ceiling, wait).await {
            Err(_) => Err(CacheError::WaitTimeout),
            Ok(Err(_)) => Err(CacheError::LoaderGone),
            Ok(Ok(outcome)) => Ok((*outcome).clone().flatten()),
        };
        result
    }

    /// Periodic sweep of expired entries until `cancel` fires.
    pub fn spawn_janitor(&self, cancel: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_PERIOD);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired cache entries");
                        }
                    }
                }
            }
        });
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.entries.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(id: u16) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_loader() {
        let cache = KnockCache::new(Duration::from_secs(3600));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("demo", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some((message(0), 30))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert!(result.is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn none_outcome_is_not_cached() {
        let cache = KnockCache::new(Duration::from_secs(3600));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let outcome = cache
                .get_or_compute("demo", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    None
                })
                .await
                .unwrap();
            assert!(outcome.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn zero_ttl_returns_once_without_caching() {
        let cache = KnockCache::new(Duration::from_secs(3600));
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let calls_for_loader = Arc::clone(&calls);
            let outcome = cache
                .get_or_compute("demo", move || async move {
                    calls_for_loader.fetch_add(1, Ordering::SeqCst);
                    Some((message(0), 0))
                })
                .await
                .unwrap();
            assert!(outcome.is_some());
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn expired_entry_behaves_as_miss() {
        let cache = KnockCache::new(Duration::from_secs(3600));
        cache.insert_for("demo", message(1), Duration::from_millis(30));
        assert!(cache.get("demo").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("demo").is_none());

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn insert_overwrites_existing_entry() {
        let cache = KnockCache::new(Duration::from_secs(3600));
        cache.insert("demo", message(1), 30);
        cache.insert("demo", message(2), 30);
        assert_eq!(cache.get("demo").unwrap().id(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn waiter_timeout_does_not_cancel_the_loader() {
        let cache =
            KnockCache::with_wait_ceiling(Duration::from_secs(3600), Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_calls = Arc::clone(&calls);
        let result = cache
            .get_or_compute("demo", move || async move {
                slow_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Some((message(7), 30))
            })
            .await;
        assert!(matches!(result, Err(CacheError::WaitTimeout)));

        // The loader keeps running and its result lands in the cache.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let cached = cache
            .get_or_compute("demo", || async { None })
            .await
            .unwrap();
        assert_eq!(cached.unwrap().id(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_is_capped() {
        let cache = KnockCache::with_wait_ceiling(
            Duration::from_millis(40),
            Duration::from_secs(5),
        );
        cache.insert("demo", message(1), 3600);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("demo").is_none());
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

/// The outcome of one attempt, shared between all attached callers.
pub type Outcome<T, E> = Result<Arc<T>, Arc<E>>;

// Inner `Arc`s necessary because `Shared` hands out plain clones of the
// receiver's output rather than wrapping it for us.
type Attempt<T, E> = Shared<oneshot::Receiver<Outcome<T, E>>>;

type AttemptMap<T, E> = Arc<Mutex<BTreeMap<String, Attempt<T, E>>>>;

type Handler<A, T, E> = dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// A keyed, call-coalescing cache around a single async operation.
///
/// Concurrent [`fire`](Self::fire) calls sharing a key observe exactly one
/// invocation of the underlying handler and share its eventual outcome, while
/// calls with distinct keys run independently.
///
/// Per key, an attempt moves through three states: absent, pending, and
/// resolved. A successful attempt is resolved forever and all later calls for
/// its key return the cached value immediately. A failed attempt delivers its
/// error to every attached caller and is evicted, so the next call for that
/// key starts over. There is no expiration, eviction of successes, or manual
/// invalidation.
pub struct CoalescingCache<A, T, E> {
    handler: Arc<Handler<A, T, E>>,

    /// Running and resolved attempts, keyed by the caller-chosen string.
    entries: AttemptMap<T, E>,
}

impl<A, T, E> Clone for CoalescingCache<A, T, E> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        CoalescingCache {
            handler: Arc::clone(&self.handler),
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<A, T, E> fmt::Debug for CoalescingCache<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("CoalescingCache")
            .field("entries", &entries)
            .finish()
    }
}

impl<A, T, E> CoalescingCache<A, T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a new cache around `handler`.
    ///
    /// The handler is bound for the lifetime of the cache and is invoked at
    /// most once per attempt, no matter how many callers fire its key.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        CoalescingCache {
            handler: Arc::new(move |args| handler(args).boxed()),
            entries: Default::default(),
        }
    }

    /// Runs the handler for `key`, or attaches to the attempt already stored
    /// under it.
    ///
    /// The first call for an absent key invokes the handler with `args` and
    /// publishes the attempt before it completes, so concurrent callers find
    /// and attach to it. A caller that finds an existing entry has its `args`
    /// silently dropped: a key denotes an operation, not an argument set, and
    /// the first caller's arguments are the ones that run.
    ///
    /// Every caller attached to one attempt receives the identical outcome.
    /// A success stays cached for the lifetime of the cache; a failure is
    /// delivered to the attached callers and the entry is evicted, so the
    /// next call for that key starts a fresh attempt. The cache adds no
    /// errors of its own and never retries by itself.
    ///
    /// The attempt is driven by a detached task, so dropping the future
    /// returned here does not cancel the handler or affect other callers.
    ///
    /// # Panics
    ///
    /// Panics if the attempt's channel is cancelled, which happens only when
    /// the handler itself panicked or the runtime is shutting down. Must be
    /// called from within a tokio runtime.
    pub async fn fire(&self, key: &str, args: A) -> Outcome<T, E> {
        let attempt = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(attempt) => {
                    tracing::trace!(key, "coalescing into existing attempt");
                    attempt.clone()
                }
                None => self.start_attempt(&mut entries, key, args),
            }
        };

        match attempt.await {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => {
                panic!("attempt channel cancelled, handler panicked or runtime shut down")
            }
        }
    }

    /// Starts a fresh attempt for `key` and stores it in `entries`.
    ///
    /// The caller holds the entry lock, making check-then-insert-then-invoke
    /// atomic: two callers racing on an absent key cannot both invoke the
    /// handler. The computation runs in a detached task that completes the
    /// shared channel, evicting the entry first if the handler failed.
    fn start_attempt(
        &self,
        entries: &mut BTreeMap<String, Attempt<T, E>>,
        key: &str,
        args: A,
    ) -> Attempt<T, E> {
        tracing::trace!(key, "starting new attempt");
        let computation = (self.handler)(args);

        let (tx, rx) = oneshot::channel();
        let attempt = rx.shared();
        entries.insert(key.to_owned(), attempt.clone());

        let key = key.to_owned();
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let outcome = match computation.await {
                Ok(value) => Ok(Arc::new(value)),
                Err(err) => {
                    // Evict before publishing the failure: a caller that sees
                    // the failure and immediately retries must find the key
                    // absent, not the dead attempt.
                    entries.lock().remove(&key);
                    tracing::debug!(key = %key, "attempt failed, entry evicted");
                    Err(Arc::new(err))
                }
            };

            // All receivers may be gone if every caller lost interest; the
            // attempt still ran to completion.
            tx.send(outcome).ok();
        });

        attempt
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time;

    use super::*;

    fn setup() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("groundwork_cache=trace"))
            .with_target(false)
            .with_test_writer()
            .try_init()
            .ok();
    }

    /// A cache whose handler counts invocations and echoes its argument back
    /// after a short delay.
    fn delayed_echo(calls: Arc<AtomicUsize>) -> CoalescingCache<u32, u32, String> {
        CoalescingCache::new(move |arg: u32| {
            calls.fetch_add(1, Ordering::Relaxed);
            async move {
                time::sleep(Duration::from_millis(10)).await;
                Ok(arg)
            }
        })
    }

    #[tokio::test]
    async fn test_coalescing() {
        setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = delayed_echo(Arc::clone(&calls));

        time::pause();
        let (a, b, c) = futures::join!(cache.fire("k", 1), cache.fire("k", 2), cache.fire("k", 3));

        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        // The first caller's argument is the one that ran.
        assert_eq!((*a, *b, *c), (1, 1, 1));
        // All callers share one value, not equal copies.
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = delayed_echo(Arc::clone(&calls));

        time::pause();
        let (a, b) = futures::join!(cache.fire("left", 1), cache.fire("right", 2));

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(*a.unwrap(), 1);
        assert_eq!(*b.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_success_is_permanent() {
        setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = delayed_echo(Arc::clone(&calls));

        time::pause();
        let first = cache.fire("k", 1).await.unwrap();
        let second = cache.fire("k", 2).await.unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_race_safety() {
        setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = delayed_echo(Arc::clone(&calls));

        time::pause();
        let results =
            futures::future::join_all((0..100).map(|caller| cache.fire("shared", caller))).await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(results.len(), 100);
        for result in results {
            assert_eq!(*result.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_evicted() {
        setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = {
            let calls = Arc::clone(&calls);
            CoalescingCache::new(move |_: ()| {
                let attempt = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    time::sleep(Duration::from_millis(10)).await;
                    if attempt == 0 {
                        Err("boom".to_string())
                    } else {
                        Ok(42)
                    }
                }
            })
        };

        time::pause();
        let (a, b) = futures::join!(cache.fire("x", ()), cache.fire("x", ()));

        // Both attached callers observe the same failure.
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert_eq!(*a, "boom");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // The failed attempt was evicted, so the key is fireable again.
        let value = cache.fire("x", ()).await.unwrap();
        assert_eq!(*value, 42);
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        // And the second attempt's success is now permanent.
        let again = cache.fire("x", ()).await.unwrap();
        assert!(Arc::ptr_eq(&value, &again));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_attempt_outlives_caller() {
        setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = delayed_echo(Arc::clone(&calls));

        time::pause();
        {
            let fire = cache.fire("k", 1);
            futures::pin_mut!(fire);
            // Poll once so the attempt is started, then walk away.
            assert!(futures::poll!(&mut fire).is_pending());
        }

        // The handler was not cancelled: a later call attaches to the
        // original attempt and sees the abandoned caller's argument.
        let value = cache.fire("k", 2).await.unwrap();
        assert_eq!(*value, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}

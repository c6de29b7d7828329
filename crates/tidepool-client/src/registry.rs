//! Reference-counted subscription deduplication.
//!
//! Consumers of the same logical resource (a table or filtered view,
//! identified by a key string) share one underlying transport subscription.
//! [`SubscriptionRegistry::acquire`] hands out the shared resource and bumps
//! a refcount; [`SubscriptionRegistry::release`] decrements, and the last
//! release runs the subscription's teardown exactly once.
//!
//! Concurrent first acquires for one key are single-flight: one caller runs
//! the factory, the rest wait on the same pending slot and share the result.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Cleanup callback run once when a subscription's refcount reaches zero.
pub type Teardown = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
enum PendingOutcome {
    Waiting,
    Ready,
    Failed(String),
}

enum EntryState {
    /// Factory in flight; waiters share the receiver.
    Pending(watch::Receiver<PendingOutcome>),
    /// Live subscription.
    Ready {
        resource: Arc<dyn Any + Send + Sync>,
        teardown: Option<Teardown>,
    },
}

struct Entry {
    refcount: u32,
    state: EntryState,
}

/// Deduplicating, reference-counting registry of live subscriptions.
///
/// One instance per connection context; constructed explicitly and passed
/// to stores so tests can build isolated registries.
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the shared resource for `key`, creating it on first use.
    ///
    /// If a live entry exists its refcount is bumped and the existing
    /// resource returned without touching the transport. Otherwise
    /// `factory` runs once to establish the subscription; it returns the
    /// resource plus the teardown that will undo the subscription on the
    /// final release. A failed factory leaves no entry behind, so the next
    /// acquire retries.
    ///
    /// Awaiting subscription readiness inside the factory is the one
    /// suspension point consumers go through; once `acquire` returns, all
    /// reads on the resource are synchronous.
    pub async fn acquire<T, F, Fut>(&self, key: &str, factory: F) -> Result<Arc<T>, ClientError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Teardown), ClientError>>,
    {
        // Join an existing entry if there is one, otherwise claim the key
        // with a pending slot before running the factory lock-free.
        let (pending_tx, waiter_rx) = {
            let mut entries = self.entries();
            match entries.get_mut(key) {
                Some(entry) => match &entry.state {
                    EntryState::Ready { resource, .. } => {
                        entry.refcount += 1;
                        debug!(key, refcount = entry.refcount, "joined existing subscription");
                        let resource = Arc::clone(resource);
                        return downcast(key, resource);
                    }
                    EntryState::Pending(rx) => {
                        entry.refcount += 1;
                        debug!(key, refcount = entry.refcount, "waiting on pending subscription");
                        (None, Some(rx.clone()))
                    }
                },
                None => {
                    let (tx, rx) = watch::channel(PendingOutcome::Waiting);
                    entries.insert(
                        key.to_string(),
                        Entry {
                            refcount: 1,
                            state: EntryState::Pending(rx),
                        },
                    );
                    (Some(tx), None)
                }
            }
        };

        if let Some(mut rx) = waiter_rx {
            return self.await_pending(key, &mut rx).await;
        }

        // This task owns the pending slot; tx is always Some here.
        let Some(tx) = pending_tx else {
            return Err(ClientError::Subscription {
                key: key.to_string(),
                message: "registry entered an impossible pending state".to_string(),
            });
        };

        debug!(key, "creating subscription");
        match factory().await {
            Ok((resource, teardown)) => {
                let resource = Arc::new(resource);
                let mut entries = self.entries();
                match entries.get_mut(key) {
                    Some(entry) => {
                        entry.state = EntryState::Ready {
                            resource: resource.clone(),
                            teardown: Some(teardown),
                        };
                        drop(entries);
                        let _ = tx.send(PendingOutcome::Ready);
                        Ok(resource)
                    }
                    None => {
                        // Every holder released while we were subscribing;
                        // undo the fresh subscription and hand the caller a
                        // detached handle.
                        drop(entries);
                        warn!(key, "subscription released before setup completed");
                        let _ = tx.send(PendingOutcome::Failed(
                            "released before setup completed".to_string(),
                        ));
                        teardown();
                        Ok(resource)
                    }
                }
            }
            Err(e) => {
                self.entries().remove(key);
                let _ = tx.send(PendingOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait for the in-flight factory on `key` and share its outcome.
    async fn await_pending<T: Send + Sync + 'static>(
        &self,
        key: &str,
        rx: &mut watch::Receiver<PendingOutcome>,
    ) -> Result<Arc<T>, ClientError> {
        loop {
            let outcome = rx.borrow_and_update().clone();
            match outcome {
                PendingOutcome::Ready => break,
                PendingOutcome::Failed(message) => {
                    return Err(ClientError::Subscription {
                        key: key.to_string(),
                        message,
                    });
                }
                PendingOutcome::Waiting => {
                    if rx.changed().await.is_err() {
                        return Err(ClientError::Subscription {
                            key: key.to_string(),
                            message: "subscription setup abandoned".to_string(),
                        });
                    }
                }
            }
        }

        let entries = self.entries();
        match entries.get(key) {
            Some(Entry {
                state: EntryState::Ready { resource, .. },
                ..
            }) => {
                let resource = Arc::clone(resource);
                drop(entries);
                downcast(key, resource)
            }
            _ => Err(ClientError::Subscription {
                key: key.to_string(),
                message: "subscription torn down during acquire".to_string(),
            }),
        }
    }

    /// Drop one reference to `key`; the final release tears the
    /// subscription down exactly once.
    ///
    /// Releasing an unknown key logs and is a no-op, so double-release
    /// from cleanup races never escalates.
    pub fn release(&self, key: &str) {
        let removed = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                warn!(key, "release for unknown subscription key");
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                debug!(key, refcount = entry.refcount, "released subscription reference");
                return;
            }
            entries.remove(key)
        };

        match removed {
            Some(Entry {
                state: EntryState::Ready { teardown, .. },
                ..
            }) => {
                debug!(key, "tearing down subscription");
                if let Some(teardown) = teardown {
                    teardown();
                }
            }
            Some(Entry {
                state: EntryState::Pending(_),
                ..
            }) => {
                // Teardown happens when the in-flight factory completes and
                // finds its entry gone.
                warn!(key, "subscription released while still pending");
            }
            None => {}
        }
    }

    /// Number of live or pending subscriptions.
    pub fn active_count(&self) -> usize {
        self.entries().len()
    }

    /// Current refcount for `key`, if it exists.
    pub fn refcount(&self, key: &str) -> Option<u32> {
        self.entries().get(key).map(|e| e.refcount)
    }

    /// Whether `key` has a live or pending entry.
    pub fn is_active(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T: Send + Sync + 'static>(
    key: &str,
    resource: Arc<dyn Any + Send + Sync>,
) -> Result<Arc<T>, ClientError> {
    resource.downcast::<T>().map_err(|_| ClientError::Subscription {
        key: key.to_string(),
        message: "subscription key reused with a different resource type".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeSub;

    struct Counters {
        created: AtomicUsize,
        torn_down: AtomicUsize,
    }

    impl Counters {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                torn_down: AtomicUsize::new(0),
            })
        }
    }

    fn counting_factory(
        counters: Arc<Counters>,
    ) -> impl FnOnce() -> std::pin::Pin<
        Box<dyn Future<Output = Result<(FakeSub, Teardown), ClientError>> + Send>,
    > {
        move || {
            Box::pin(async move {
                counters.created.fetch_add(1, Ordering::SeqCst);
                let teardown_counters = counters.clone();
                let teardown: Teardown = Box::new(move || {
                    teardown_counters.torn_down.fetch_add(1, Ordering::SeqCst);
                });
                Ok((FakeSub, teardown))
            })
        }
    }

    #[tokio::test]
    async fn test_acquire_twice_creates_once() {
        let registry = SubscriptionRegistry::new();
        let counters = Counters::new();

        let a = registry
            .acquire::<FakeSub, _, _>("board-1-cards", counting_factory(counters.clone()))
            .await
            .unwrap();
        let b = registry
            .acquire::<FakeSub, _, _>("board-1-cards", counting_factory(counters.clone()))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount("board-1-cards"), Some(2));
    }

    #[tokio::test]
    async fn test_release_tears_down_after_last_reference() {
        let registry = SubscriptionRegistry::new();
        let counters = Counters::new();

        registry
            .acquire::<FakeSub, _, _>("board-1-cards", counting_factory(counters.clone()))
            .await
            .unwrap();
        registry
            .acquire::<FakeSub, _, _>("board-1-cards", counting_factory(counters.clone()))
            .await
            .unwrap();

        registry.release("board-1-cards");
        assert!(registry.is_active("board-1-cards"));
        assert_eq!(counters.torn_down.load(Ordering::SeqCst), 0);

        registry.release("board-1-cards");
        assert!(!registry.is_active("board-1-cards"));
        assert_eq!(counters.torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_unknown_key_is_noop() {
        let registry = SubscriptionRegistry::new();
        registry.release("never-acquired");
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_factory_leaves_no_entry() {
        let registry = SubscriptionRegistry::new();

        let result = registry
            .acquire::<FakeSub, _, _>("bad-key", || async {
                Err(ClientError::Subscription {
                    key: "bad-key".to_string(),
                    message: "malformed filter".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        assert!(!registry.is_active("bad-key"));

        // A later acquire retries the factory.
        let counters = Counters::new();
        registry
            .acquire::<FakeSub, _, _>("bad-key", counting_factory(counters.clone()))
            .await
            .unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_are_single_flight() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let counters = Counters::new();

        let slow_factory = {
            let counters = counters.clone();
            move || async move {
                counters.created.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let teardown: Teardown = Box::new(|| {});
                Ok((FakeSub, teardown))
            }
        };

        let late_counters = counters.clone();
        let (a, b, c) = tokio::join!(
            registry.acquire::<FakeSub, _, _>("shared", slow_factory),
            registry.acquire::<FakeSub, _, _>("shared", counting_factory(late_counters.clone())),
            registry.acquire::<FakeSub, _, _>("shared", counting_factory(late_counters)),
        );

        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount("shared"), Some(3));
    }

    #[tokio::test]
    async fn test_waiters_see_factory_failure() {
        let registry = Arc::new(SubscriptionRegistry::new());

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(ClientError::Subscription {
                key: "doomed".to_string(),
                message: "rejected".to_string(),
            })
        };

        let counters = Counters::new();
        let (a, b) = tokio::join!(
            registry.acquire::<FakeSub, _, _>("doomed", failing),
            registry.acquire::<FakeSub, _, _>("doomed", counting_factory(counters.clone())),
        );

        assert!(a.is_err());
        assert!(b.is_err());
        // The waiter never ran its own factory.
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
        assert!(!registry.is_active("doomed"));
    }

    #[tokio::test]
    async fn test_key_type_mismatch_is_an_error() {
        let registry = SubscriptionRegistry::new();
        let counters = Counters::new();

        registry
            .acquire::<FakeSub, _, _>("key", counting_factory(counters))
            .await
            .unwrap();

        let result = registry
            .acquire::<String, _, _>("key", || async {
                let teardown: Teardown = Box::new(|| {});
                Ok(("other".to_string(), teardown))
            })
            .await;

        assert!(matches!(result, Err(ClientError::Subscription { .. })));
    }

    #[tokio::test]
    async fn test_reacquire_after_teardown_creates_fresh_subscription() {
        let registry = SubscriptionRegistry::new();
        let counters = Counters::new();

        registry
            .acquire::<FakeSub, _, _>("key", counting_factory(counters.clone()))
            .await
            .unwrap();
        registry.release("key");
        registry
            .acquire::<FakeSub, _, _>("key", counting_factory(counters.clone()))
            .await
            .unwrap();

        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.torn_down.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount("key"), Some(1));
    }
}

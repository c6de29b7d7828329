//! Memoized derived values over table mirrors.
//!
//! A [`DerivedView`] caches the result of a pure computation over one or
//! more mirrors. Change events from tracked mirrors only mark the cache
//! dirty; nothing recomputes until the next read.
//!
//! ## Rules for compute functions
//!
//! The compute closure is a read: it may take mirror snapshots and build a
//! value, but it must not mutate a mirror or another view's cache. The
//! view writes its own cache inside [`DerivedView::read`], after compute
//! returns. Reading a mirror snapshot once per recompute keeps each
//! derived value internally consistent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tidepool_client::{TableMirror, TableRow};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A lazily recomputed value derived from mirror contents.
pub struct DerivedView<T> {
    compute: Box<dyn Fn() -> T + Send + Sync>,
    cache: RwLock<Option<Arc<T>>>,
    dirty: AtomicBool,
}

impl<T: Send + Sync + 'static> DerivedView<T> {
    /// Wrap a compute function. The view starts dirty, so the first read
    /// runs the computation.
    pub fn new(compute: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            compute: Box::new(compute),
            cache: RwLock::new(None),
            dirty: AtomicBool::new(true),
        })
    }

    /// Current value, recomputing only if a dependency changed since the
    /// last read.
    pub fn read(&self) -> Arc<T> {
        if !self.dirty.load(Ordering::Acquire) {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(value) = cache.as_ref() {
                return value.clone();
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);

        // A racing reader may have recomputed while we waited for the lock.
        if !self.dirty.load(Ordering::Acquire)
            && let Some(value) = cache.as_ref()
        {
            return value.clone();
        }

        // Cleared before computing: an invalidation that lands mid-compute
        // marks the view dirty again and forces another pass.
        self.dirty.store(false, Ordering::SeqCst);
        let value = Arc::new((self.compute)());
        *cache = Some(value.clone());
        value
    }

    /// Mark the cached value stale. Recomputation is deferred to the next
    /// [`DerivedView::read`].
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Whether the next read will recompute.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Invalidate this view whenever `mirror` changes.
    ///
    /// Spawns a forwarding task that turns every change event into an
    /// `invalidate` call. The task holds the view alive and stops when the
    /// mirror's change channel closes. Call once per mirror the compute
    /// function reads.
    pub fn track<R: TableRow>(self: &Arc<Self>, mirror: &TableMirror<R>) {
        let mut rx = mirror.changes();
        let view = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) => view.invalidate(),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed events still only mean "stale".
                        warn!(skipped = n, "derived view listener lagged");
                        view.invalidate();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("change channel closed, stopping view listener");
                        break;
                    }
                }
            }
        });
    }
}

// === Unit Tests ===

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tidepool_client::{Card, RowOpKind, RowSink};

    fn make_card(card_id: u64, board_id: u64, status: &str) -> serde_json::Value {
        json!({
            "cardId": card_id,
            "boardId": board_id,
            "title": format!("card {card_id}"),
            "status": status,
            "position": 0,
            "createdAt": "2025-06-01T12:00:00Z",
        })
    }

    /// Poll until `cond` holds; panics after one second.
    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[test]
    fn test_first_read_computes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let view = DerivedView::new(move || counter.fetch_add(1, Ordering::SeqCst) + 1);

        assert!(view.is_dirty());
        assert_eq!(*view.read(), 1);
        assert!(!view.is_dirty());
    }

    #[test]
    fn test_reads_are_memoized() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let view = DerivedView::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            42
        });

        for _ in 0..5 {
            assert_eq!(*view.read(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_defers_recompute_to_next_read() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let view = DerivedView::new(move || counter.fetch_add(1, Ordering::SeqCst));

        view.read();
        view.invalidate();
        view.invalidate();

        // Invalidation alone never runs the computation.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(view.is_dirty());

        view.read();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_reflects_current_dependency_state() {
        let source = Arc::new(AtomicUsize::new(3));
        let dep = source.clone();
        let view = DerivedView::new(move || dep.load(Ordering::SeqCst));

        assert_eq!(*view.read(), 3);

        source.store(9, Ordering::SeqCst);
        // Stale until invalidated, current after.
        assert_eq!(*view.read(), 3);
        view.invalidate();
        assert_eq!(*view.read(), 9);
    }

    #[tokio::test]
    async fn test_tracked_mirror_changes_invalidate() {
        let mirror: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());
        let counting = mirror.clone();
        let view = DerivedView::new(move || counting.len());
        view.track(&mirror);

        mirror.ingest_applied(vec![make_card(1, 7, "todo")]);
        eventually(|| view.is_dirty()).await;
        assert_eq!(*view.read(), 1);

        mirror.ingest_op(RowOpKind::Insert, make_card(2, 7, "todo"));
        eventually(|| view.is_dirty()).await;
        assert_eq!(*view.read(), 2);
    }

    #[tokio::test]
    async fn test_listener_stops_when_mirror_dropped() {
        let mirror: Arc<TableMirror<Card>> = Arc::new(TableMirror::new());
        let view = DerivedView::new(|| 0usize);
        view.track(&mirror);

        view.read();
        drop(mirror);

        // The forwarding task exits on channel close; the view itself
        // keeps serving its last value.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*view.read(), 0);
    }
}

//! Local mirrors of remote tables.
//!
//! A [`TableMirror`] holds the latest-known rows of one remote table for one
//! subscription. It is fed exclusively by the socket reader task:
//! a bulk load when the subscription is applied, then incremental row
//! operations in arrival order. Consumers read snapshots and subscribe to a
//! per-event change broadcast; they never mutate the mirror.
//!
//! ## Lifecycle
//!
//! A mirror starts in `Pending` and reads as empty. When the subscription's
//! bulk load arrives the rows are installed and the state flips to
//! `Applied` in one step, so readers observe either the empty pre-load
//! state or a complete snapshot, never a partial one. Row operations that
//! race ahead of the bulk load are buffered and replayed in order once it
//! lands. If the server rejects the subscription the mirror moves to
//! `Failed` and keeps reading as empty.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::proto::RowOpKind;
use crate::records::TableRow;

/// Capacity of the per-mirror change broadcast channel.
const CHANGE_CAPACITY: usize = 4096;

/// Maximum row operations buffered while waiting for the bulk load.
const MAX_PENDING_OPS: usize = 10_000;

/// Lifecycle state of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MirrorState {
    /// Subscribed but the initial bulk load has not arrived.
    Pending = 0,
    /// Bulk load installed; incremental events apply directly.
    Applied = 1,
    /// The server rejected the subscription; the mirror stays empty.
    Failed = 2,
}

impl MirrorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MirrorState::Applied,
            2 => MirrorState::Failed,
            _ => MirrorState::Pending,
        }
    }
}

/// A change applied to a mirror, broadcast synchronously after each event.
#[derive(Debug, Clone)]
pub enum RowChange<R> {
    /// The initial bulk load was installed.
    Applied,
    /// A row was added.
    Inserted(R),
    /// An existing row was replaced (last write wins).
    Updated(R),
    /// A row was removed; carries its last value.
    Deleted(R),
    /// The mirror was cleared back to its pre-load state.
    Cleared,
}

/// Ingestion interface the socket loop drives, one sink per (subscription,
/// table) pair. Implemented by [`TableMirror`]; store factories hand sinks
/// to `Connection::subscribe` to wire routing.
pub trait RowSink: Send + Sync {
    /// Remote table this sink accepts rows for.
    fn table(&self) -> &'static str;

    /// Install the subscription's initial bulk load.
    fn ingest_applied(&self, rows: Vec<Value>);

    /// Apply one incremental row operation.
    fn ingest_op(&self, kind: RowOpKind, row: Value);

    /// The server rejected the owning subscription.
    fn mark_failed(&self);

    /// Clear back to the pre-load state (subscription torn down).
    fn reset(&self);
}

/// Local mirror of one remote table for one subscription.
///
/// Reads are cheap clones out of a concurrent map; all mutation comes from
/// the single socket reader task, so state checks and row updates on the
/// ingestion path never race each other.
pub struct TableMirror<R: TableRow> {
    rows: DashMap<R::Key, R>,
    state: AtomicU8,
    pending: Mutex<VecDeque<(RowOpKind, R)>>,
    changes: broadcast::Sender<RowChange<R>>,
}

impl<R: TableRow> TableMirror<R> {
    /// Create an empty mirror in the `Pending` state.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            rows: DashMap::new(),
            state: AtomicU8::new(MirrorState::Pending as u8),
            pending: Mutex::new(VecDeque::new()),
            changes,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MirrorState {
        MirrorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the initial bulk load has been installed.
    pub fn is_applied(&self) -> bool {
        self.state() == MirrorState::Applied
    }

    /// Look up a row by key. Returns `None` until the bulk load applies.
    pub fn get(&self, key: &R::Key) -> Option<R> {
        if !self.is_applied() {
            return None;
        }
        self.rows.get(key).map(|r| r.value().clone())
    }

    /// Clone out all current rows. Empty until the bulk load applies.
    pub fn snapshot(&self) -> Vec<R> {
        if !self.is_applied() {
            return Vec::new();
        }
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    /// Number of rows visible to readers.
    pub fn len(&self) -> usize {
        if !self.is_applied() { 0 } else { self.rows.len() }
    }

    /// Whether readers currently see no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to per-event change notifications.
    pub fn changes(&self) -> broadcast::Receiver<RowChange<R>> {
        self.changes.subscribe()
    }

    /// Send a change notification, ignoring the no-subscriber case.
    fn notify(&self, change: RowChange<R>) {
        let _ = self.changes.send(change);
    }

    fn pending_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<(RowOpKind, R)>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply one decoded operation to the live row map.
    fn apply_now(&self, kind: RowOpKind, row: R) {
        match kind {
            // Inserts and updates both upsert: an update racing ahead of
            // its insert lands as an insert, and a duplicate insert is an
            // overwrite. Last write wins either way.
            RowOpKind::Insert | RowOpKind::Update => {
                let key = row.key();
                match self.rows.entry(key) {
                    Entry::Occupied(mut entry) => {
                        entry.insert(row.clone());
                        self.notify(RowChange::Updated(row));
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(row.clone());
                        self.notify(RowChange::Inserted(row));
                    }
                }
            }
            RowOpKind::Delete => {
                if let Some((_, old)) = self.rows.remove(&row.key()) {
                    self.notify(RowChange::Deleted(old));
                } else {
                    trace!(table = R::TABLE, "ignoring delete for absent row");
                }
            }
        }
    }

    /// Buffer an operation that arrived before the bulk load.
    fn buffer_op(&self, kind: RowOpKind, row: R) {
        let mut queue = self.pending_queue();
        if queue.len() >= MAX_PENDING_OPS {
            queue.pop_front();
            warn!(
                table = R::TABLE,
                max = MAX_PENDING_OPS,
                "pending op buffer full, dropping oldest"
            );
        }
        queue.push_back((kind, row));
    }
}

impl<R: TableRow> Default for TableMirror<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: TableRow> RowSink for TableMirror<R> {
    fn table(&self) -> &'static str {
        R::TABLE
    }

    fn ingest_applied(&self, rows: Vec<Value>) {
        self.rows.clear();
        for value in rows {
            match serde_json::from_value::<R>(value) {
                Ok(row) => {
                    self.rows.insert(row.key(), row);
                }
                Err(e) => {
                    warn!(table = R::TABLE, error = %e, "dropping undecodable row in bulk load");
                }
            }
        }
        self.state.store(MirrorState::Applied as u8, Ordering::SeqCst);
        self.notify(RowChange::Applied);

        // Replay anything that raced ahead of the bulk load, oldest first.
        // Upserts are idempotent and deletes of absent rows are no-ops, so
        // replaying an op the load already reflects is harmless.
        let buffered: Vec<(RowOpKind, R)> = self.pending_queue().drain(..).collect();
        if !buffered.is_empty() {
            debug!(
                table = R::TABLE,
                count = buffered.len(),
                "replaying ops buffered during bulk load"
            );
        }
        for (kind, row) in buffered {
            self.apply_now(kind, row);
        }
    }

    fn ingest_op(&self, kind: RowOpKind, row: Value) {
        let row: R = match serde_json::from_value(row) {
            Ok(row) => row,
            Err(e) => {
                warn!(table = R::TABLE, error = %e, "dropping undecodable row");
                return;
            }
        };
        match self.state() {
            MirrorState::Applied => self.apply_now(kind, row),
            MirrorState::Pending => self.buffer_op(kind, row),
            MirrorState::Failed => {
                trace!(table = R::TABLE, "dropping op for failed subscription");
            }
        }
    }

    fn mark_failed(&self) {
        self.state.store(MirrorState::Failed as u8, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.rows.clear();
        self.pending_queue().clear();
        self.state.store(MirrorState::Pending as u8, Ordering::SeqCst);
        self.notify(RowChange::Cleared);
    }
}

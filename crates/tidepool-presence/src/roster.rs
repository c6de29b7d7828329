//! Server-reported viewer roster with a lease-expiry backstop.
//!
//! The roster follows the board-viewer mirror: inserts and updates
//! refresh a session's lease, deletes (the server expiring or a viewer
//! leaving) remove it. Entries are session-granular, keyed by
//! (board, connection); the read side deduplicates by subject, so one
//! person viewing from three tabs counts once.
//!
//! Leases exist only as a backstop. The server is the authority on
//! expiry and normally announces it with a delete event; the TTL reaps
//! entries whose delete event was lost across a disconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tidepool_client::{BoardViewer, ConnectionId, Identity, RowChange, TableMirror, TableRow};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long an entry stays live without a refresh (three missed
/// heartbeats).
pub const LEASE_TTL: Duration = Duration::from_secs(90);

/// How often the background sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Lease {
    viewer: BoardViewer,
    expires_at: Instant,
}

/// Who is viewing which board, according to the server.
pub struct ViewerRoster {
    entries: DashMap<(u64, ConnectionId), Lease>,
}

impl ViewerRoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    /// Follow a board-viewer mirror, reflecting its change events.
    ///
    /// Spawns a listener that stops when the mirror's change channel
    /// closes. A new bulk load replaces the roster wholesale; a lagged
    /// listener resyncs from the mirror snapshot. The listener keeps only
    /// a weak handle on the mirror, so dropping the mirror ends it.
    pub fn follow(self: &Arc<Self>, mirror: &Arc<TableMirror<BoardViewer>>) {
        let mut rx = mirror.changes();
        let roster = Arc::clone(self);
        let mirror = Arc::downgrade(mirror);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RowChange::Applied) => {
                        let Some(mirror) = mirror.upgrade() else { break };
                        roster.reset_from(mirror.snapshot());
                    }
                    Ok(RowChange::Inserted(viewer) | RowChange::Updated(viewer)) => {
                        roster.touch(viewer);
                    }
                    Ok(RowChange::Deleted(viewer)) => roster.forget(&viewer.key()),
                    Ok(RowChange::Cleared) => roster.clear(),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "viewer roster lagged, resyncing from mirror");
                        let Some(mirror) = mirror.upgrade() else { break };
                        roster.reset_from(mirror.snapshot());
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("viewer channel closed, stopping roster listener");
                        break;
                    }
                }
            }
        });
    }

    /// Start the background sweep that reaps expired leases.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let roster = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;

                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            debug!("roster sweeper stopping");
                            return;
                        }
                    }

                    _ = interval.tick() => {
                        let swept = roster.sweep_expired();
                        if swept > 0 {
                            debug!(swept, "reaped expired viewer leases");
                        }
                    }
                }
            }
        });
    }

    /// Distinct subjects currently viewing `board_id`, sorted.
    pub fn viewers(&self, board_id: u64) -> Vec<Identity> {
        let now = Instant::now();
        let subjects: HashSet<Identity> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == board_id && entry.value().expires_at > now)
            .map(|entry| entry.value().viewer.identity)
            .collect();

        let mut subjects: Vec<Identity> = subjects.into_iter().collect();
        subjects.sort();
        subjects
    }

    /// Number of distinct subjects viewing `board_id`.
    pub fn viewer_count(&self, board_id: u64) -> usize {
        self.viewers(board_id).len()
    }

    /// Number of live sessions viewing `board_id`, counting every tab.
    pub fn session_count(&self, board_id: u64) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.key().0 == board_id && entry.value().expires_at > now)
            .count()
    }

    /// Install or refresh a session's lease.
    fn touch(&self, viewer: BoardViewer) {
        let key = viewer.key();
        trace!(board_id = key.0, connection_id = %key.1, "viewer lease refreshed");
        self.entries.insert(
            key,
            Lease {
                viewer,
                expires_at: Instant::now() + LEASE_TTL,
            },
        );
    }

    /// Drop a session the server reported gone.
    fn forget(&self, key: &(u64, ConnectionId)) {
        if self.entries.remove(key).is_some() {
            trace!(board_id = key.0, connection_id = %key.1, "viewer left");
        }
    }

    /// Replace the roster with a fresh bulk load.
    fn reset_from(&self, viewers: Vec<BoardViewer>) {
        self.entries.clear();
        for viewer in viewers {
            self.touch(viewer);
        }
    }

    fn clear(&self) {
        self.entries.clear();
    }

    /// Remove expired leases; returns how many were reaped.
    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, ConnectionId)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }
        expired.len()
    }
}

// === Unit Tests ===

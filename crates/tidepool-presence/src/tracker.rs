//! Viewing-state tracker: join, heartbeat, leave.
//!
//! Per board, a viewer is either not viewing or viewing. Entering the
//! viewing state calls the `join_board` reducer and starts a repeating
//! heartbeat; the returned [`PresenceGuard`] embodies the state, and
//! dropping it leaves. Expiry of *other* viewers is decided server-side
//! and arrives as delete events on the viewer table; this module never
//! declares anyone expired locally.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidepool_client::Connection;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::PresenceError;

/// How often a viewing session re-asserts liveness.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Issues presence reducer calls for one connection.
pub struct PresenceTracker {
    conn: Arc<Connection>,
    interval: Duration,
}

impl PresenceTracker {
    /// Track presence over `conn` with the standard heartbeat cadence.
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Override the heartbeat cadence.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start viewing a board.
    ///
    /// Calls `join_board` and, once the server commits it, starts the
    /// heartbeat loop. The guard leaves the board when dropped.
    pub async fn join(&self, board_id: u64) -> Result<PresenceGuard, PresenceError> {
        self.conn
            .call_reducer("join_board", json!({ "boardId": board_id }))
            .await
            .map_err(|source| PresenceError::Join { board_id, source })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(heartbeat_loop(
            self.conn.clone(),
            board_id,
            self.interval,
            shutdown_rx,
        ));
        debug!(board_id, "joined board");

        Ok(PresenceGuard {
            conn: self.conn.clone(),
            board_id,
            shutdown: shutdown_tx,
            left: false,
        })
    }
}

/// Re-asserts liveness until told to stop.
///
/// Each ping runs detached so a slow or hung reducer call never delays
/// the next tick. Failures are logged and the timer keeps going; the
/// server's own timeout is what expires a silent session.
async fn heartbeat_loop(
    conn: Arc<Connection>,
    board_id: u64,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; the join itself just asserted
    // liveness, so skip it.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    debug!(board_id, "heartbeat loop stopping");
                    return;
                }
            }

            _ = interval.tick() => {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let args = json!({ "boardId": board_id });
                    if let Err(e) = conn.call_reducer("heartbeat", args).await {
                        warn!(board_id, error = %e, "presence heartbeat failed");
                    }
                });
            }
        }
    }
}

/// Live viewing state for one board.
///
/// Dropping the guard cancels the heartbeat timer unconditionally and
/// issues a best-effort `leave_board`; a leave that cannot be sent or is
/// rejected is logged, never surfaced.
pub struct PresenceGuard {
    conn: Arc<Connection>,
    board_id: u64,
    shutdown: watch::Sender<bool>,
    left: bool,
}

impl PresenceGuard {
    /// Board this guard is viewing.
    pub fn board_id(&self) -> u64 {
        self.board_id
    }

    /// Leave explicitly, waiting for the leave call to resolve.
    ///
    /// The timer is cancelled before the network call, so a failed leave
    /// still stops the heartbeats.
    pub async fn leave(mut self) {
        self.shutdown.send_replace(true);
        self.left = true;

        let args = json!({ "boardId": self.board_id });
        if let Err(e) = self.conn.call_reducer("leave_board", args).await {
            warn!(board_id = self.board_id, error = %e, "explicit leave failed");
        } else {
            debug!(board_id = self.board_id, "left board");
        }
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if self.left {
            return;
        }

        let conn = self.conn.clone();
        let board_id = self.board_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let args = json!({ "boardId": board_id });
                    if let Err(e) = conn.call_reducer("leave_board", args).await {
                        debug!(board_id, error = %e, "best-effort leave failed");
                    }
                });
            }
            Err(_) => {
                debug!(board_id, "no runtime at drop, leave relies on server timeout");
            }
        }
    }
}

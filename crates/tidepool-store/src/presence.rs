use std::sync::Arc;

use tidepool_client::{BoardViewer, Identity, RowSink, TableMirror, Teardown};
use tidepool_presence::{PresenceGuard, PresenceTracker, ViewerRoster};
use tokio::sync::watch;

use crate::context::StoreContext;
use crate::error::StoreError;

fn presence_key(board_id: u64) -> String {
    format!("presence:{board_id}")
}

fn presence_query(board_id: u64) -> String {
    format!("SELECT * FROM board_viewer WHERE board_id = {board_id}")
}

/// One board's viewer subscription, shared through the registry.
///
/// The mirror itself is not stored: it stays alive through the route table
/// and the roster listener, and dies once the subscription is torn down.
struct PresenceResource {
    roster: Arc<ViewerRoster>,
}

/// Membership on one board: joins on open, leaves on drop.
///
/// Wraps the heartbeat loop and the shared viewer roster. Several sessions
/// on the same board share one viewer subscription but each keeps its own
/// heartbeat, since the server tracks liveness per connection.
pub struct PresenceSession {
    ctx: Arc<StoreContext>,
    board_id: u64,
    key: String,
    roster: Arc<ViewerRoster>,
    guard: Option<PresenceGuard>,
}

impl PresenceSession {
    /// Join `board_id` and start mirroring its viewer roster.
    ///
    /// Fails if the viewer subscription is rejected or the join reducer
    /// does not commit; presence without a successful join is meaningless,
    /// so there is no degraded-but-open mode here.
    pub async fn open(ctx: Arc<StoreContext>, board_id: u64) -> Result<Self, StoreError> {
        let key = presence_key(board_id);
        let resource = ctx
            .registry()
            .acquire(&key, || async {
                let mirror = Arc::new(TableMirror::<BoardViewer>::new());
                let roster = ViewerRoster::new();
                roster.follow(&mirror);
                let (sweep_tx, sweep_rx) = watch::channel(false);
                roster.start_sweeper(sweep_rx);

                let sinks: Vec<Arc<dyn RowSink>> = vec![mirror.clone()];
                let ticket = ctx
                    .connection()
                    .subscribe(&key, vec![presence_query(board_id)], sinks)
                    .await?;

                let conn = ctx.connection().clone();
                let teardown: Teardown = Box::new(move || {
                    conn.unsubscribe(ticket);
                    sweep_tx.send_replace(true);
                    mirror.reset();
                });
                Ok((PresenceResource { roster }, teardown))
            })
            .await?;

        let tracker = PresenceTracker::new(ctx.connection().clone());
        let guard = match tracker.join(board_id).await {
            Ok(guard) => guard,
            Err(e) => {
                ctx.registry().release(&key);
                return Err(e.into());
            }
        };

        Ok(Self {
            ctx,
            board_id,
            key,
            roster: resource.roster.clone(),
            guard: Some(guard),
        })
    }

    pub fn board_id(&self) -> u64 {
        self.board_id
    }

    /// Distinct identities currently viewing the board, sorted.
    pub fn viewers(&self) -> Vec<Identity> {
        self.roster.viewers(self.board_id)
    }

    /// Number of distinct identities viewing the board.
    pub fn viewer_count(&self) -> usize {
        self.roster.viewer_count(self.board_id)
    }

    /// Number of live sessions, counting each tab separately.
    pub fn session_count(&self) -> usize {
        self.roster.session_count(self.board_id)
    }

    /// Leave explicitly, waiting for the leave call to go out.
    pub async fn leave(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.leave().await;
        }
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        // Leave before releasing, so the departure goes out while the
        // viewer subscription is still active.
        self.guard.take();
        self.ctx.registry().release(&self.key);
    }
}

/// Join `board_id` on this context. Shorthand for [`PresenceSession::open`].
pub async fn presence(ctx: Arc<StoreContext>, board_id: u64) -> Result<PresenceSession, StoreError> {
    PresenceSession::open(ctx, board_id).await
}

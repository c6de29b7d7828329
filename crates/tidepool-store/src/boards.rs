use std::sync::Arc;

use serde_json::json;
use tidepool_client::{
    Board, ClientError, Identity, RowChange, RowSink, TableMirror, Teardown,
};
use tokio::sync::broadcast;
use tracing::warn;

use crate::context::StoreContext;
use crate::error::StoreError;

const BOARDS_KEY: &str = "boards";
const BOARDS_QUERY: &str = "SELECT * FROM board";

/// The process-wide boards subscription, shared through the registry.
struct BoardsResource {
    mirror: Arc<TableMirror<Board>>,
}

/// Reactive handle over every board visible to this identity.
///
/// All openers of the store share one mirror and one wire subscription;
/// dropping the last opener unsubscribes.
pub struct BoardStore {
    ctx: Arc<StoreContext>,
    mirror: Arc<TableMirror<Board>>,
    error: Option<String>,
    owns_ref: bool,
}

impl BoardStore {
    /// Open the boards store, joining the shared subscription.
    ///
    /// Returns once the server has applied the subscription, so the first
    /// read already sees the full board list. A server-side rejection does
    /// not fail construction: the store comes back with [`error`](Self::error)
    /// set and an empty mirror. Transport failures do fail construction.
    pub async fn open(ctx: Arc<StoreContext>) -> Result<Self, StoreError> {
        let acquired = ctx
            .registry()
            .acquire(BOARDS_KEY, || async {
                let mirror = Arc::new(TableMirror::<Board>::new());
                let sinks: Vec<Arc<dyn RowSink>> = vec![mirror.clone()];
                let ticket = ctx
                    .connection()
                    .subscribe(BOARDS_KEY, vec![BOARDS_QUERY.to_string()], sinks)
                    .await?;

                let conn = ctx.connection().clone();
                let retired = mirror.clone();
                let teardown: Teardown = Box::new(move || {
                    conn.unsubscribe(ticket);
                    retired.reset();
                });
                Ok((BoardsResource { mirror }, teardown))
            })
            .await;

        match acquired {
            Ok(resource) => Ok(Self {
                ctx,
                mirror: resource.mirror.clone(),
                error: None,
                owns_ref: true,
            }),
            Err(ClientError::Subscription { key, message }) => {
                warn!(key = %key, message = %message, "boards subscription rejected");
                Ok(Self {
                    ctx,
                    mirror: Arc::new(TableMirror::new()),
                    error: Some(message),
                    owns_ref: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Boards sorted by id. Empty until the subscription applies.
    pub fn boards(&self) -> Vec<Board> {
        let mut rows = self.mirror.snapshot();
        rows.sort_by_key(|b| b.board_id);
        rows
    }

    pub fn board(&self, board_id: u64) -> Option<Board> {
        self.mirror.get(&board_id)
    }

    /// Row-level change feed for the board table.
    pub fn changes(&self) -> broadcast::Receiver<RowChange<Board>> {
        self.mirror.changes()
    }

    /// Rejection message from the server, if the subscription failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.mirror.is_applied()
    }

    /// Underlying mirror, for derived views.
    pub fn mirror(&self) -> &Arc<TableMirror<Board>> {
        &self.mirror
    }

    pub async fn create_board(&self, name: &str) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer("create_board", json!({ "name": name }))
            .await?;
        Ok(())
    }

    pub async fn add_collaborator(
        &self,
        board_id: u64,
        collaborator: Identity,
    ) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer(
                "add_collaborator",
                json!({ "boardId": board_id, "collaborator": collaborator }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_board(&self, board_id: u64) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer("delete_board", json!({ "boardId": board_id }))
            .await?;
        Ok(())
    }
}

impl Drop for BoardStore {
    fn drop(&mut self) {
        if self.owns_ref {
            self.ctx.registry().release(BOARDS_KEY);
        }
    }
}

use std::sync::Arc;

use serde_json::json;
use tidepool_client::{
    Card, CardStatus, ClientError, Identity, RowChange, RowSink, TableMirror, Teardown,
};
use tokio::sync::broadcast;
use tracing::warn;

use crate::context::StoreContext;
use crate::error::StoreError;

fn cards_key(board_id: u64) -> String {
    format!("board_cards:{board_id}")
}

fn cards_query(board_id: u64) -> String {
    format!("SELECT * FROM card WHERE board_id = {board_id}")
}

/// One board's card subscription, shared through the registry.
struct CardsResource {
    mirror: Arc<TableMirror<Card>>,
}

/// Reactive handle over the cards of a single board.
///
/// Every opener for the same board shares one mirror and one wire
/// subscription; two views of the same board cost one subscription, not two.
pub struct CardStore {
    ctx: Arc<StoreContext>,
    board_id: u64,
    key: String,
    mirror: Arc<TableMirror<Card>>,
    error: Option<String>,
    owns_ref: bool,
}

impl CardStore {
    /// Open the card store for `board_id`, joining any existing subscription
    /// for that board.
    ///
    /// Same contract as [`BoardStore::open`](crate::BoardStore::open): a
    /// server rejection yields a store with [`error`](Self::error) set and an
    /// empty mirror, while transport failures fail construction.
    pub async fn open(ctx: Arc<StoreContext>, board_id: u64) -> Result<Self, StoreError> {
        let key = cards_key(board_id);
        let acquired = ctx
            .registry()
            .acquire(&key, || async {
                let mirror = Arc::new(TableMirror::<Card>::new());
                let sinks: Vec<Arc<dyn RowSink>> = vec![mirror.clone()];
                let ticket = ctx
                    .connection()
                    .subscribe(&key, vec![cards_query(board_id)], sinks)
                    .await?;

                let conn = ctx.connection().clone();
                let retired = mirror.clone();
                let teardown: Teardown = Box::new(move || {
                    conn.unsubscribe(ticket);
                    retired.reset();
                });
                Ok((CardsResource { mirror }, teardown))
            })
            .await;

        match acquired {
            Ok(resource) => Ok(Self {
                ctx,
                board_id,
                key,
                mirror: resource.mirror.clone(),
                error: None,
                owns_ref: true,
            }),
            Err(ClientError::Subscription { key, message }) => {
                warn!(key = %key, message = %message, "card subscription rejected");
                Ok(Self {
                    ctx,
                    board_id,
                    key,
                    mirror: Arc::new(TableMirror::new()),
                    error: Some(message),
                    owns_ref: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn board_id(&self) -> u64 {
        self.board_id
    }

    /// Cards in column order: by position, then id for ties.
    pub fn cards(&self) -> Vec<Card> {
        let mut rows = self.mirror.snapshot();
        rows.sort_by_key(|c| (c.position, c.card_id));
        rows
    }

    pub fn card(&self, card_id: u64) -> Option<Card> {
        self.mirror.get(&card_id)
    }

    /// Row-level change feed for this board's cards.
    pub fn changes(&self) -> broadcast::Receiver<RowChange<Card>> {
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
    pub fn mirror(&self) -> &Arc<TableMirror<Card>> {
        &self.mirror
    }

    pub async fn create_card(&self, title: &str) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer(
                "create_card",
                json!({ "boardId": self.board_id, "title": title }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, card_id: u64, status: CardStatus) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer(
                "set_card_status",
                json!({ "cardId": card_id, "status": status }),
            )
            .await?;
        Ok(())
    }

    /// Assign or unassign a card; `None` clears the assignee.
    pub async fn assign(
        &self,
        card_id: u64,
        assignee: Option<Identity>,
    ) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer(
                "assign_card",
                json!({ "cardId": card_id, "assignee": assignee }),
            )
            .await?;
        Ok(())
    }

    pub async fn move_card(&self, card_id: u64, position: u32) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer(
                "move_card",
                json!({ "cardId": card_id, "position": position }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_card(&self, card_id: u64) -> Result<(), StoreError> {
        self.ctx
            .connection()
            .call_reducer("delete_card", json!({ "cardId": card_id }))
            .await?;
        Ok(())
    }
}

impl Drop for CardStore {
    fn drop(&mut self) {
        if self.owns_ref {
            self.ctx.registry().release(&self.key);
        }
    }
}

//! Table name constants and mirrored row types.
//!
//! Every row type that can be mirrored implements [`TableRow`], which ties
//! the type to its remote table name and stable key. The generic machinery
//! in `mirror.rs` and `socket.rs` works purely through this trait; adding a
//! table means defining the row struct and implementing `TableRow` for it.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::types::{ConnectionId, Identity};

/// Remote table holding kanban boards.
pub const BOARD_TABLE: &str = "board";

/// Remote table holding cards.
pub const CARD_TABLE: &str = "card";

/// Remote table holding per-session board viewers (presence rows).
pub const BOARD_VIEWER_TABLE: &str = "board_viewer";

/// A row type mirrored from a remote table.
///
/// The key is unique within the table; a mirror never holds two entries
/// with the same key. Events carry whole rows, so `key` must be derivable
/// from the row itself.
pub trait TableRow:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable per-row identifier within the table.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Remote table name this row type belongs to.
    const TABLE: &'static str;

    /// Extract the row's key.
    fn key(&self) -> Self::Key;
}

/// A kanban board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    /// Server-assigned board id.
    pub board_id: u64,
    /// Display name.
    pub name: String,
    /// Identity of the board's creator.
    pub owner: Identity,
    /// Identities the owner has shared the board with.
    #[serde(default)]
    pub collaborators: Vec<Identity>,
    /// Creation time, set server-side.
    pub created_at: DateTime<Utc>,
}

impl TableRow for Board {
    type Key = u64;
    const TABLE: &'static str = BOARD_TABLE;

    fn key(&self) -> u64 {
        self.board_id
    }
}

impl Board {
    /// Whether the given subject may see this board.
    pub fn visible_to(&self, identity: &Identity) -> bool {
        self.owner == *identity || self.collaborators.contains(identity)
    }
}

/// Workflow status of a card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    /// Not started.
    #[default]
    Todo,
    /// Being worked on.
    InProgress,
    /// Finished.
    Done,
}

/// A card on a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    /// Server-assigned card id.
    pub card_id: u64,
    /// Board this card belongs to.
    pub board_id: u64,
    /// Card title.
    pub title: String,
    /// Current workflow status.
    pub status: CardStatus,
    /// Subject the card is assigned to, if any.
    #[serde(default)]
    pub assignee: Option<Identity>,
    /// Ordering position within its status column.
    pub position: u32,
    /// Creation time, set server-side.
    pub created_at: DateTime<Utc>,
}

impl TableRow for Card {
    type Key = u64;
    const TABLE: &'static str = CARD_TABLE;

    fn key(&self) -> u64 {
        self.card_id
    }
}

/// One session currently viewing a board.
///
/// Keyed by (board, connection) so the same subject viewing from two
/// sessions produces two rows; viewer counts deduplicate by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardViewer {
    /// Board being viewed.
    pub board_id: u64,
    /// Viewing subject.
    pub identity: Identity,
    /// The viewing session.
    pub connection_id: ConnectionId,
    /// Last time the server saw a heartbeat for this session.
    pub last_active: DateTime<Utc>,
}

impl TableRow for BoardViewer {
    type Key = (u64, ConnectionId);
    const TABLE: &'static str = BOARD_VIEWER_TABLE;

    fn key(&self) -> Self::Key {
        (self.board_id, self.connection_id)
    }
}

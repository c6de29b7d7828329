//! Wire protocol messages.
//!
//! The transport is a WebSocket carrying JSON text frames, one message per
//! frame, externally tagged with `"type"`. The envelope uses snake_case
//! field names; row payloads inside `rows`/`ops` are raw JSON objects in
//! the table's own (camelCase) schema, decoded later by the typed mirror
//! that owns the table.
//!
//! Protocol flow:
//! 1. Client opens the socket; server sends `identity_token` first.
//! 2. Client sends `subscribe` with query strings; server answers with one
//!    `subscribe_applied` (initial bulk load) or `subscribe_error`.
//! 3. Committed changes stream in as `transaction_update` messages.
//! 4. `call_reducer` / `reducer_result` pairs are correlated by request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ConnectionId, Identity};

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a subscription for one or more table queries.
    Subscribe {
        /// Client-minted subscription id.
        sub_id: u64,
        /// Query strings describing the rows to mirror.
        queries: Vec<String>,
    },
    /// Tear down a previously registered subscription.
    Unsubscribe {
        /// Id from the original `subscribe`.
        sub_id: u64,
    },
    /// Invoke a named server-side reducer.
    CallReducer {
        /// Client-minted correlation id.
        request_id: u64,
        /// Reducer name.
        reducer: String,
        /// Positional or named arguments, reducer-defined.
        args: Value,
    },
}

/// Messages pushed from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message after the socket opens; completes the handshake.
    IdentityToken {
        /// Subject identity for this session.
        identity: Identity,
        /// Token that resumes this identity on reconnect.
        token: String,
        /// Server-minted id for this connection.
        connection_id: ConnectionId,
    },
    /// Initial bulk load for every table a subscription covers.
    SubscribeApplied {
        /// Id from the original `subscribe`.
        sub_id: u64,
        /// Current rows per table, as of subscription time.
        rows: Vec<TableRowSet>,
    },
    /// The server rejected a subscription.
    SubscribeError {
        /// Id from the original `subscribe`.
        sub_id: u64,
        /// Human-readable rejection reason.
        message: String,
    },
    /// Incremental committed changes across one transaction.
    TransactionUpdate {
        /// Per-table row operations, in commit order.
        tables: Vec<TableUpdate>,
    },
    /// Outcome of a `call_reducer`.
    ReducerResult {
        /// Id from the original `call_reducer`.
        request_id: u64,
        /// Committed or failed.
        status: ReducerStatus,
    },
}

/// All current rows of one table at subscription time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRowSet {
    /// Remote table name.
    pub table: String,
    /// Row payloads in the table's schema.
    pub rows: Vec<Value>,
}

/// Row operations for one table within a transaction.
///
/// Updates are scoped to the subscription whose queries matched the rows,
/// so one committed transaction can fan out into several entries when it
/// touches rows covered by more than one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUpdate {
    /// Subscription these operations belong to.
    pub sub_id: u64,
    /// Remote table name.
    pub table: String,
    /// Operations in commit order.
    pub ops: Vec<RowOp>,
}

/// A single row operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOp {
    /// What happened to the row.
    pub op: RowOpKind,
    /// The row payload. For deletes this is the deleted row's last value,
    /// carried so the client can derive the key.
    pub row: Value,
}

/// Kind of row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOpKind {
    /// New row.
    Insert,
    /// Replacement of an existing row (last write wins).
    Update,
    /// Row removed.
    Delete,
}

/// Outcome of a reducer invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReducerStatus {
    /// The reducer ran and its transaction committed.
    Committed,
    /// The reducer was rejected (validation, authorization, not-found).
    Failed {
        /// Server-provided reason.
        message: String,
    },
}

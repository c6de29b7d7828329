//! Presence error types.

use thiserror::Error;
use tidepool_client::ClientError;

/// Errors from presence operations.
///
/// Only joining can fail loudly. Heartbeats and leaves are best-effort by
/// contract and log instead of returning errors.
#[derive(Error, Debug)]
pub enum PresenceError {
    /// The join reducer was rejected or could not be sent.
    #[error("failed to join board {board_id}: {source}")]
    Join {
        /// Board the join targeted.
        board_id: u64,
        /// Underlying client failure.
        #[source]
        source: ClientError,
    },

    /// Any other client failure.
    #[error(transparent)]
    Client(#[from] ClientError),
}

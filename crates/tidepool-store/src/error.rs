use thiserror::Error;
use tidepool_client::ClientError;
use tidepool_presence::PresenceError;

/// Errors surfaced by the store layer.
///
/// Stores mostly pass client errors straight through; the variants exist so
/// callers can keep matching on one type per layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

//! Board, card, and presence stores for Tidepool clients.
//!
//! This crate is the application-facing layer: each store wraps one shared
//! table subscription behind synchronous reads and reducer-backed writes.
//! Everything hangs off an explicit [`StoreContext`] rather than process
//! globals, so independent contexts can coexist in one process.
//!
//! ## Features
//!
//! - **BoardStore**: the authorized board list with create/share/delete
//! - **CardStore**: one board's cards with the full mutation set
//! - **PresenceSession**: join-on-open, leave-on-drop board membership

mod boards;
mod cards;
mod context;
mod error;
mod presence;

pub use boards::BoardStore;
pub use cards::CardStore;
pub use context::StoreContext;
pub use error::StoreError;
pub use presence::{PresenceSession, presence};

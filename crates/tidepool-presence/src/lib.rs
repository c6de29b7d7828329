//! Presence for Tidepool boards: who is viewing what, kept honest by
//! heartbeats.
//!
//! Viewing a board is a lease against the server: `join_board` opens it,
//! a 30-second heartbeat keeps it alive, and `leave_board` (or the
//! server's own timeout) closes it. The roster side consumes the
//! board-viewer table mirror and answers "who is here" with per-subject
//! deduplication across tabs.
//!
//! ## Features
//!
//! - **PresenceTracker**: join/heartbeat/leave lifecycle with guard Drop
//! - **ViewerRoster**: session-granular viewer map with lease backstop

mod error;
pub mod roster;
pub mod tracker;

pub use error::PresenceError;
pub use roster::{LEASE_TTL, ViewerRoster};
pub use tracker::{HEARTBEAT_INTERVAL, PresenceGuard, PresenceTracker};

//! Derived, memoized views over Tidepool table mirrors.
//!
//! Views are pure computations over mirror snapshots, cached until a
//! tracked mirror reports a change. Invalidation is lazy: a change only
//! marks the cache dirty, and the next read recomputes.
//!
//! ## Features
//!
//! - **DerivedView**: memoize-and-invalidate wrapper for any computation
//! - **Board activity**: per-board card counts partitioned by status
//! - **Visible cards**: ownership/collaboration join across two mirrors

pub mod boards;
pub mod view;

pub use boards::{BoardActivity, board_activity, visible_cards};
pub use view::DerivedView;

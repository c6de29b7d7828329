//! Reactive client for Tidepool's push-based table protocol.
//!
//! This crate maintains live local mirrors of server-side tables over a
//! WebSocket subscription stream, so reads are synchronous map lookups
//! and writes go through named server reducers.
//!
//! ## Features
//!
//! - **Connection**: authenticated WebSocket session with reducer calls
//! - **Mirror**: per-subscription table replicas with change broadcasts
//! - **Registry**: refcounted, deduplicated subscription lifecycle
//! - **Reconnect**: opt-in supervisor that re-dials with backoff

mod client;
mod error;
pub mod mirror;
pub mod proto;
mod records;
pub mod registry;
pub mod reconnect;
mod socket;
mod types;

pub use client::{ConnectConfig, Connection, SubscriptionTicket};
pub use error::ClientError;
pub use mirror::{MirrorState, RowChange, RowSink, TableMirror};
pub use proto::{ClientMessage, ReducerStatus, RowOp, RowOpKind, ServerMessage, TableUpdate};
pub use reconnect::run_with_reconnect;
pub use records::*;
pub use registry::{SubscriptionRegistry, Teardown};
pub use types::{ConnectionId, IDENTITY_LEN, Identity, SessionInfo};

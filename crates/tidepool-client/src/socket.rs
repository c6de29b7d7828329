//! Socket event loop.
//!
//! After the handshake the WebSocket is split into a reader task and a
//! writer task. The reader answers pings, decodes server messages, and
//! dispatches them through a shared [`RouteTable`]: bulk loads and row
//! operations go to the sinks registered per subscription, reducer results
//! complete their correlated oneshot. The writer drains an mpsc queue of
//! outbound messages so senders never touch the socket directly.
//!
//! Both tasks watch a shutdown signal and exit promptly; when either side
//! of the socket goes down the route table fails every in-flight call so
//! callers see `ConnectionClosed` instead of hanging.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::mirror::RowSink;
use crate::proto::{ClientMessage, ReducerStatus, ServerMessage, TableRowSet, TableUpdate};
use crate::types::SessionInfo;

/// Buffer size for the outbound writer queue.
pub(crate) const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Commands accepted by the writer task.
pub(crate) enum Outbound {
    /// A protocol message to encode and send.
    Message(ClientMessage),
    /// Pong reply carrying the ping's payload.
    Pong(Vec<u8>),
}

struct SubscriptionRoute {
    /// Sink per table covered by this subscription.
    sinks: HashMap<String, Arc<dyn RowSink>>,
    /// Resolves the subscriber's await once applied or rejected.
    applied: Option<oneshot::Sender<Result<(), String>>>,
}

/// Routing state shared between the connection handle and the reader task.
#[derive(Default)]
pub(crate) struct RouteTable {
    subscriptions: DashMap<u64, SubscriptionRoute>,
    reducers: DashMap<u64, oneshot::Sender<ReducerStatus>>,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register sinks for a subscription about to be sent; the returned
    /// receiver resolves when the server applies or rejects it.
    pub(crate) fn register_subscription(
        &self,
        sub_id: u64,
        sinks: Vec<Arc<dyn RowSink>>,
    ) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        let sinks = sinks
            .into_iter()
            .map(|sink| (sink.table().to_string(), sink))
            .collect();
        self.subscriptions.insert(
            sub_id,
            SubscriptionRoute {
                sinks,
                applied: Some(tx),
            },
        );
        rx
    }

    /// Drop routing for a subscription (after unsubscribe).
    pub(crate) fn remove_subscription(&self, sub_id: u64) {
        self.subscriptions.remove(&sub_id);
    }

    /// Register a reducer call awaiting its result.
    pub(crate) fn register_reducer(&self, request_id: u64) -> oneshot::Receiver<ReducerStatus> {
        let (tx, rx) = oneshot::channel();
        self.reducers.insert(request_id, tx);
        rx
    }

    /// Forget a registered call whose request was never sent.
    pub(crate) fn cancel_reducer(&self, request_id: u64) {
        self.reducers.remove(&request_id);
    }

    fn apply_subscription(&self, sub_id: u64, rows: Vec<TableRowSet>) {
        let Some(mut route) = self.subscriptions.get_mut(&sub_id) else {
            trace!(sub_id, "bulk load for unknown subscription");
            return;
        };
        for set in rows {
            match route.sinks.get(set.table.as_str()) {
                Some(sink) => sink.ingest_applied(set.rows),
                None => trace!(sub_id, table = %set.table, "no sink for table in bulk load"),
            }
        }
        match route.applied.take() {
            Some(tx) => {
                let _ = tx.send(Ok(()));
            }
            None => warn!(sub_id, "duplicate subscribe_applied"),
        }
    }

    fn fail_subscription(&self, sub_id: u64, message: String) {
        match self.subscriptions.remove(&sub_id) {
            Some((_, mut route)) => {
                warn!(sub_id, message = %message, "subscription rejected");
                for sink in route.sinks.values() {
                    sink.mark_failed();
                }
                if let Some(tx) = route.applied.take() {
                    let _ = tx.send(Err(message));
                }
            }
            None => warn!(sub_id, "error for unknown subscription"),
        }
    }

    fn apply_transaction(&self, tables: Vec<TableUpdate>) {
        for update in tables {
            let Some(route) = self.subscriptions.get(&update.sub_id) else {
                // Teardown races a final update; nothing to apply it to.
                trace!(sub_id = update.sub_id, "update for unknown subscription");
                continue;
            };
            match route.sinks.get(update.table.as_str()) {
                Some(sink) => {
                    for op in update.ops {
                        sink.ingest_op(op.op, op.row);
                    }
                }
                None => trace!(table = %update.table, "no sink for table in update"),
            }
        }
    }

    fn complete_reducer(&self, request_id: u64, status: ReducerStatus) {
        match self.reducers.remove(&request_id) {
            Some((_, tx)) => {
                let _ = tx.send(status);
            }
            None => warn!(request_id, "result for unknown reducer call"),
        }
    }

    /// Fail every in-flight call by dropping its sender, waking the caller
    /// with a closed channel. Called when the socket goes down.
    pub(crate) fn fail_pending(&self) {
        self.reducers.clear();
        for mut route in self.subscriptions.iter_mut() {
            route.applied.take();
        }
    }
}

/// Dispatch one decoded server message through the route table.
fn dispatch(routes: &RouteTable, message: ServerMessage) {
    match message {
        ServerMessage::IdentityToken { .. } => {
            warn!("unexpected identity_token after handshake");
        }
        ServerMessage::SubscribeApplied { sub_id, rows } => {
            routes.apply_subscription(sub_id, rows);
        }
        ServerMessage::SubscribeError { sub_id, message } => {
            routes.fail_subscription(sub_id, message);
        }
        ServerMessage::TransactionUpdate { tables } => {
            routes.apply_transaction(tables);
        }
        ServerMessage::ReducerResult { request_id, status } => {
            routes.complete_reducer(request_id, status);
        }
    }
}

/// Read the handshake off a fresh socket before splitting it.
///
/// The server's first protocol message must be `identity_token`; anything
/// else fails the connect.
pub(crate) async fn read_identity<S>(
    ws: &mut WebSocketStream<S>,
) -> Result<SessionInfo, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let message: ServerMessage = serde_json::from_str(&text)
                    .map_err(|e| ClientError::Handshake(format!("unparseable message: {e}")))?;
                match message {
                    ServerMessage::IdentityToken {
                        identity,
                        token,
                        connection_id,
                    } => {
                        return Ok(SessionInfo {
                            identity,
                            token,
                            connection_id,
                        });
                    }
                    other => {
                        return Err(ClientError::Handshake(format!(
                            "expected identity_token, got {other:?}"
                        )));
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = ws.send(Message::Pong(data)).await {
                    return Err(ClientError::Handshake(format!("pong failed: {e}")));
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Handshake(
                    "connection closed during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => {
                // Binary and pong frames are not part of the handshake.
            }
            Some(Err(e)) => {
                return Err(ClientError::Handshake(format!("read error: {e}")));
            }
        }
    }
}

/// Reader task: answers pings immediately and dispatches server messages.
pub(crate) async fn reader_task<S>(
    mut read: SplitStream<WebSocketStream<S>>,
    routes: Arc<RouteTable>,
    outbound: mpsc::Sender<Outbound>,
    connected_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("socket reader received shutdown signal");
                    break;
                }
            }

            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => dispatch(&routes, message),
                            Err(e) => warn!(error = %e, "ignoring unparseable server message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        trace!("received ping, queueing pong");
                        if let Err(e) = outbound.try_send(Outbound::Pong(data)) {
                            warn!(error = %e, "failed to queue pong");
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ignore binary and pong frames.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                    None => {
                        info!("websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // The session is over, however we got here: flip liveness and wake
    // every caller still waiting on a response.
    connected_tx.send_replace(false);
    routes.fail_pending();
    debug!("socket reader exited");
}

/// Writer task: drains the outbound queue onto the socket.
pub(crate) async fn writer_task<S>(
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("socket writer received shutdown signal");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }

            command = outbound_rx.recv() => {
                match command {
                    Some(Outbound::Message(message)) => {
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to encode outbound message");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "websocket write failed");
                            break;
                        }
                    }
                    Some(Outbound::Pong(data)) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!(error = %e, "websocket write failed");
                            break;
                        }
                    }
                    None => {
                        debug!("outbound channel closed, writer exiting");
                        break;
                    }
                }
            }
        }
    }
}

//! Connection handle to the remote data source.
//!
//! [`Connection::connect`] opens the WebSocket, completes the identity
//! handshake, persists the auth token for session resumption, and spawns
//! the socket tasks. The handle is then the single entry point for
//! subscriptions and reducer calls; it fails fast with
//! [`ClientError::NotConnected`] once the session is gone and never
//! retries on its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::mirror::RowSink;
use crate::proto::{ClientMessage, ReducerStatus};
use crate::socket::{self, OUTBOUND_CHANNEL_SIZE, Outbound, RouteTable};
use crate::types::{ConnectionId, Identity, SessionInfo};

/// Where and how to connect.
///
/// ```no_run
/// # use tidepool_client::{ConnectConfig, Connection};
/// # async fn example() -> Result<(), tidepool_client::ClientError> {
/// let config = ConnectConfig::new("wss://boards.example.com", "kanban")
///     .with_token_file("/var/lib/tidepool/token");
/// let conn = Connection::connect(config).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    uri: String,
    module: String,
    token: Option<String>,
    token_file: Option<PathBuf>,
}

impl ConnectConfig {
    /// Target a server and module (database name).
    pub fn new(uri: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            module: module.into(),
            token: None,
            token_file: None,
        }
    }

    /// Resume a previous identity with an explicit token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Load the resumption token from `path` if present, and persist the
    /// token issued at handshake back to it.
    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }

    /// Build the subscribe endpoint URL, with the resumption token as a
    /// query parameter when present.
    fn subscribe_url(&self, token: Option<&str>) -> String {
        let base = format!(
            "{}/database/{}/subscribe",
            self.uri.trim_end_matches('/'),
            self.module
        );
        match token {
            Some(token) => format!("{base}?token={token}"),
            None => base,
        }
    }
}

/// Handle for one live transport subscription, used to tear it down.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionTicket {
    sub_id: u64,
}

/// A single authenticated session with the remote data source.
pub struct Connection {
    session: SessionInfo,
    routes: Arc<RouteTable>,
    outbound: mpsc::Sender<Outbound>,
    connected_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    next_sub_id: AtomicU64,
    next_request_id: AtomicU64,
}

impl Connection {
    /// Connect, complete the handshake, and spawn the socket tasks.
    ///
    /// Fails with [`ClientError::Connect`] or [`ClientError::Handshake`]
    /// without retrying; reconnect policy belongs to a wrapping layer.
    pub async fn connect(config: ConnectConfig) -> Result<Self, ClientError> {
        let token = match (&config.token, &config.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(path)) => load_token(path).await?,
            (None, None) => None,
        };

        let url = config.subscribe_url(token.as_deref());
        info!(module = %config.module, resuming = token.is_some(), "connecting");

        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        Self::from_socket(ws, config.token_file).await
    }

    /// Establish a session over an already-open WebSocket.
    ///
    /// This is the seam for in-process transports: tests drive a duplex
    /// pipe through it instead of a TCP socket.
    pub async fn from_socket<S>(
        mut ws: WebSocketStream<S>,
        token_file: Option<PathBuf>,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = socket::read_identity(&mut ws).await?;
        info!(
            identity = %session.identity,
            connection_id = %session.connection_id,
            "session established"
        );

        if let Some(path) = &token_file
            && let Err(e) = store_token(path, &session.token).await
        {
            // Resumption is best-effort; the session itself is unaffected.
            warn!(error = %e, path = %path.display(), "failed to persist auth token");
        }

        let routes = Arc::new(RouteTable::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (connected_tx, connected_rx) = watch::channel(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (write, read) = ws.split();
        tokio::spawn(socket::reader_task(
            read,
            routes.clone(),
            outbound_tx.clone(),
            connected_tx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(socket::writer_task(write, outbound_rx, shutdown_rx));

        Ok(Self {
            session,
            routes,
            outbound: outbound_tx,
            connected_rx,
            shutdown_tx,
            next_sub_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Subject identity for this session.
    pub fn identity(&self) -> Identity {
        self.session.identity
    }

    /// Auth token issued at handshake.
    pub fn token(&self) -> &str {
        &self.session.token
    }

    /// Server-minted id for this connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.session.connection_id
    }

    /// Whether the session is still live.
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch liveness changes (used by reconnect wrappers).
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Close the session and stop the socket tasks.
    pub fn close(&self) {
        info!("closing connection");
        self.shutdown_tx.send_replace(true);
    }

    /// Send a subscribe request and wait for the server to apply it.
    ///
    /// The sinks receive the bulk load before this returns, so the caller
    /// can read mirrors immediately afterwards. `key` is the logical
    /// resource name, used for diagnostics and error reporting.
    pub async fn subscribe(
        &self,
        key: &str,
        queries: Vec<String>,
        sinks: Vec<Arc<dyn RowSink>>,
    ) -> Result<SubscriptionTicket, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let sub_id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let applied = self.routes.register_subscription(sub_id, sinks);

        debug!(key, sub_id, "subscribing");
        if let Err(e) = self.send(ClientMessage::Subscribe { sub_id, queries }).await {
            self.routes.remove_subscription(sub_id);
            return Err(e);
        }

        match applied.await {
            Ok(Ok(())) => {
                debug!(key, sub_id, "subscription applied");
                Ok(SubscriptionTicket { sub_id })
            }
            Ok(Err(message)) => Err(ClientError::Subscription {
                key: key.to_string(),
                message,
            }),
            Err(_) => {
                self.routes.remove_subscription(sub_id);
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    /// Tear down a subscription, best-effort and without blocking.
    ///
    /// Routing stops immediately; the unsubscribe message is queued if the
    /// connection is still up and silently skipped if it is not.
    pub fn unsubscribe(&self, ticket: SubscriptionTicket) {
        self.routes.remove_subscription(ticket.sub_id);
        let message = ClientMessage::Unsubscribe {
            sub_id: ticket.sub_id,
        };
        match self.outbound.try_send(Outbound::Message(message)) {
            Ok(()) => debug!(sub_id = ticket.sub_id, "unsubscribe sent"),
            Err(e) => debug!(sub_id = ticket.sub_id, error = %e, "unsubscribe not sent"),
        }
    }

    /// Invoke a named reducer and wait for its outcome.
    ///
    /// A server-side rejection surfaces as [`ClientError::Reducer`]. There
    /// is no client-side timeout: a call the server never answers resolves
    /// only when the connection drops.
    pub async fn call_reducer(&self, reducer: &str, args: Value) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let result = self.routes.register_reducer(request_id);

        debug!(reducer, request_id, "calling reducer");
        let message = ClientMessage::CallReducer {
            request_id,
            reducer: reducer.to_string(),
            args,
        };
        if let Err(e) = self.send(message).await {
            self.routes.cancel_reducer(request_id);
            return Err(e);
        }

        match result.await {
            Ok(ReducerStatus::Committed) => Ok(()),
            Ok(ReducerStatus::Failed { message }) => Err(ClientError::Reducer {
                reducer: reducer.to_string(),
                message,
            }),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Load a persisted resumption token. A missing file is simply no token.
async fn load_token(path: &Path) -> Result<Option<String>, ClientError> {
    match tokio::fs::read_to_string(path).await {
        Ok(encoded) => {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| ClientError::InvalidToken(e.to_string()))?;
            let token = String::from_utf8(bytes)
                .map_err(|e| ClientError::InvalidToken(e.to_string()))?;
            Ok(Some(token))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClientError::Io(e)),
    }
}

/// Persist the token issued at handshake.
async fn store_token(path: &Path, token: &str) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, BASE64.encode(token)).await?;
    Ok(())
}

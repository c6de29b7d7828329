//! Opt-in reconnect loop around [`Connection`].
//!
//! The connection handle itself never retries: a dropped transport is
//! terminal for it. Callers that want resilience run this supervisor
//! instead. It dials with exponential backoff, hands every fresh
//! [`Connection`] to a callback (the place to re-issue subscriptions),
//! and watches session liveness until the next drop or shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{ConnectConfig, Connection};
use crate::error::ClientError;

/// How one session ended.
enum Session {
    /// Shutdown was requested while the session was live.
    Shutdown,
    /// The transport dropped after the session was established.
    Lost,
}

/// Dial and re-dial `config` until shutdown is requested.
///
/// `on_connect` runs once per established session, before liveness
/// watching begins; re-subscribing belongs there. If it returns an error
/// the session is closed and counted as a failed attempt. Each session
/// that was successfully established resets the backoff, so a flapping
/// server is retried from the initial interval again.
pub async fn run_with_reconnect<F, Fut>(
    config: ConnectConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    mut on_connect: F,
) -> Result<(), ClientError>
where
    F: FnMut(Arc<Connection>) -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    };

    loop {
        if *shutdown_rx.borrow() {
            info!("reconnect supervisor shutting down");
            return Ok(());
        }

        match run_session(&config, &mut shutdown_rx, &mut on_connect).await {
            Ok(Session::Shutdown) => {
                info!("reconnect supervisor shutting down");
                return Ok(());
            }
            Ok(Session::Lost) => {
                warn!("connection lost, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                warn!(error = %e, "connect attempt failed, retrying");
            }
        }

        // Always Some since max_elapsed_time is None
        let wait_duration = backoff.next_backoff().unwrap_or(Duration::from_secs(60));

        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(wait_duration) => {}
        }
    }
}

/// Establish one session and watch it until it drops or shutdown arrives.
async fn run_session<F, Fut>(
    config: &ConnectConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
    on_connect: &mut F,
) -> Result<Session, ClientError>
where
    F: FnMut(Arc<Connection>) -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    let conn = Arc::new(Connection::connect(config.clone()).await?);

    if let Err(e) = on_connect(conn.clone()).await {
        conn.close();
        return Err(e);
    }

    let mut connected = conn.connected();
    loop {
        tokio::select! {
            biased;

            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    conn.close();
                    return Ok(Session::Shutdown);
                }
            }

            res = connected.changed() => {
                if res.is_err() || !*connected.borrow() {
                    conn.close();
                    return Ok(Session::Lost);
                }
            }
        }
    }
}

// === Unit Tests ===

use std::sync::Arc;

use tidepool_client::{ConnectConfig, Connection, Identity, SubscriptionRegistry};

use crate::error::StoreError;

/// Shared wiring for every store: one connection, one subscription registry.
///
/// Nothing here is global. Each context is an independent composition root,
/// so tests and multi-account tools can run several side by side.
pub struct StoreContext {
    conn: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
}

impl StoreContext {
    /// Wrap an established connection.
    pub fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            registry: Arc::new(SubscriptionRegistry::new()),
        })
    }

    /// Dial the module and build a context around the fresh connection.
    pub async fn connect(config: ConnectConfig) -> Result<Arc<Self>, StoreError> {
        let conn = Connection::connect(config).await?;
        Ok(Self::new(Arc::new(conn)))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Identity the server assigned to this session.
    pub fn identity(&self) -> Identity {
        self.conn.identity()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Shut down the underlying connection. Open stores keep serving their
    /// last-applied rows but stop receiving updates.
    pub fn close(&self) {
        self.conn.close();
    }
}

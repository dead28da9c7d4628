use crate::error::Result;
use crate::registry::{AdapterRegistry, ConnectionRegistry};
use crate::stream::ResultStream;
use crate::types::SchemaMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Entry points handed to the host command layer
pub struct Handler {
    connections: ConnectionRegistry,
}

impl Handler {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            connections: ConnectionRegistry::new(adapters),
        }
    }

    /// Full registry, for hosts that need more than the basic commands
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub async fn register_connection(
        &self,
        id: &str,
        connection_string: &str,
        backend_type: &str,
    ) -> Result<()> {
        debug!("register_connection: {} ({})", id, backend_type);
        self.connections
            .register(id, connection_string, backend_type)
            .await
    }

    /// The caller drains and renders the returned stream
    pub async fn execute(
        &self,
        id: &str,
        ctx: CancellationToken,
        query: &str,
    ) -> Result<ResultStream> {
        debug!("execute: {}", id);
        self.connections.execute(id, ctx, query).await
    }

    pub async fn get_schema(&self, id: &str) -> Result<SchemaMap> {
        debug!("get_schema: {}", id);
        self.connections.schema(id).await
    }

    /// Process teardown: close every open connection
    pub async fn close_all(&self) {
        let failures = self.connections.close_all().await;
        if !failures.is_empty() {
            warn!("{} connection(s) failed to close cleanly", failures.len());
        }
    }
}

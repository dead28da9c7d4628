use crate::error::Result;
use crate::stream::ResultStream;
use crate::types::{Column, DatabaseList, Structure, TableOptions};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Uniform handle to one open backend connection
///
/// A driver owns its connection for its whole lifetime. Optional capabilities
/// are exposed through the `as_*` probes rather than extra mandatory methods.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Execute a query and stream its rows
    ///
    /// Cancelling `ctx` aborts the query and releases the backend cursor even
    /// if the stream has not been drained.
    async fn query(&self, ctx: CancellationToken, query: &str) -> Result<ResultStream>;

    /// Columns of a single table
    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>>;

    /// Schema tree of the current catalog/database
    async fn structure(&self) -> Result<Vec<Structure>>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Catalog switching, for drivers that support it
    fn as_database_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        None
    }
}

/// Optional capability: list and switch the active catalog/database
#[async_trait]
pub trait DatabaseSwitcher: Send + Sync {
    /// Current catalog plus every catalog the connection can switch to
    async fn list_databases(&self) -> Result<DatabaseList>;

    /// Reconnect against `name`; on failure the current connection is kept
    async fn select_database(&self, name: &str) -> Result<()>;
}

/// Stateless per-backend factory
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Parse `url` and open exactly one driver for it
    async fn connect(&self, url: &str) -> Result<Arc<dyn Driver>>;

    /// Helper query templates for a table, keyed by a human readable label
    ///
    /// The text is handed to the backend verbatim.
    fn helpers(&self, _opts: &TableOptions) -> HashMap<String, String> {
        HashMap::new()
    }
}

use crate::error::{DataError, Result};
use crate::stream::ResultStream;
use crate::structure::flatten_structure;
use crate::traits::{Adapter, Driver};
use crate::types::{Column, DatabaseList, SchemaMap, Structure, TableOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backend type name to adapter
///
/// Built once at process start, before any connection is requested, then
/// shared read-only.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter; a later registration under the same name wins
    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn Adapter>) {
        let name = name.into();

        if self.adapters.contains_key(&name) {
            warn!("Overwriting existing adapter for backend: {}", name);
        }

        debug!("Registered adapter for backend: {}", name);
        self.adapters.insert(name, adapter);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Adapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::UnsupportedBackend(name.to_string()))
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered backend names, sorted
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Clone)]
struct Registered {
    adapter: Arc<dyn Adapter>,
    driver: Arc<dyn Driver>,
}

/// Caller-supplied connection id to open driver
///
/// The map lock is only held to look up, insert or remove entries; backend
/// I/O always runs on a cloned driver handle.
pub struct ConnectionRegistry {
    adapters: Arc<AdapterRegistry>,
    connections: Arc<RwLock<HashMap<String, Registered>>>,
}

impl ConnectionRegistry {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            adapters,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a connection through the adapter for `kind` and store it as `id`
    ///
    /// Nothing is stored when resolving or connecting fails. An existing
    /// connection with the same id is replaced, then closed.
    pub async fn register(&self, id: &str, url: &str, kind: &str) -> Result<()> {
        let adapter = self.adapters.resolve(kind)?;

        debug!("Connecting {} for backend: {}", id, kind);
        let driver = adapter.connect(url).await?;

        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(id.to_string(), Registered { adapter, driver })
        };

        if let Some(previous) = previous {
            warn!("Connection {} re-registered, closing previous driver", id);
            if let Err(e) = previous.driver.close().await {
                warn!("Failed to close replaced connection {}: {}", id, e);
            }
        }

        Ok(())
    }

    async fn entry(&self, id: &str) -> Result<Registered> {
        let connections = self.connections.read().await;
        connections
            .get(id)
            .cloned()
            .ok_or_else(|| DataError::UnknownConnection(id.to_string()))
    }

    /// Driver registered under `id`
    pub async fn driver(&self, id: &str) -> Result<Arc<dyn Driver>> {
        Ok(self.entry(id).await?.driver)
    }

    pub async fn execute(
        &self,
        id: &str,
        ctx: CancellationToken,
        query: &str,
    ) -> Result<ResultStream> {
        let driver = self.driver(id).await?;
        debug!("Executing query on {}", id);
        driver.query(ctx, query).await
    }

    pub async fn structure(&self, id: &str) -> Result<Vec<Structure>> {
        self.driver(id).await?.structure().await
    }

    /// Flattened structure: schema name -> object names
    pub async fn schema(&self, id: &str) -> Result<SchemaMap> {
        let structure = self.structure(id).await?;
        Ok(flatten_structure(&structure))
    }

    pub async fn columns(&self, id: &str, opts: &TableOptions) -> Result<Vec<Column>> {
        self.driver(id).await?.columns(opts).await
    }

    /// Helper query templates from the adapter that opened `id`
    pub async fn helpers(&self, id: &str, opts: &TableOptions) -> Result<HashMap<String, String>> {
        Ok(self.entry(id).await?.adapter.helpers(opts))
    }

    /// Whether the driver behind `id` can switch catalogs
    pub async fn supports_database_switching(&self, id: &str) -> Result<bool> {
        Ok(self.driver(id).await?.as_database_switcher().is_some())
    }

    pub async fn list_databases(&self, id: &str) -> Result<DatabaseList> {
        let driver = self.driver(id).await?;
        let switcher = driver.as_database_switcher().ok_or_else(|| {
            DataError::unsupported_capability(format!(
                "connection {} does not support switching databases",
                id
            ))
        })?;
        switcher.list_databases().await
    }

    pub async fn select_database(&self, id: &str, name: &str) -> Result<()> {
        let driver = self.driver(id).await?;
        let switcher = driver.as_database_switcher().ok_or_else(|| {
            DataError::unsupported_capability(format!(
                "connection {} does not support switching databases",
                id
            ))
        })?;

        debug!("Switching {} to database: {}", id, name);
        switcher.select_database(name).await
    }

    /// Remove and close one connection
    pub async fn close(&self, id: &str) -> Result<()> {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(id)
        };

        let entry = removed.ok_or_else(|| DataError::UnknownConnection(id.to_string()))?;
        debug!("Closing connection: {}", id);
        entry.driver.close().await
    }

    /// Close every connection, continuing past individual failures
    ///
    /// Returns the failures so teardown can report them.
    pub async fn close_all(&self) -> Vec<(String, DataError)> {
        let drained: Vec<(String, Registered)> = {
            let mut connections = self.connections.write().await;
            connections.drain().collect()
        };

        let mut failures = Vec::new();
        for (id, entry) in drained {
            debug!("Closing connection: {}", id);
            if let Err(e) = entry.driver.close().await {
                warn!("Failed to close connection {}: {}", id, e);
                failures.push((id, e));
            }
        }

        failures
    }

    /// Registered connection ids, sorted
    pub async fn ids(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut ids: Vec<String> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopDriver;

    #[async_trait]
    impl Driver for NoopDriver {
        async fn query(&self, _ctx: CancellationToken, _query: &str) -> Result<ResultStream> {
            Ok(ResultStream::from_rows(Vec::new(), Vec::new()))
        }

        async fn columns(&self, _opts: &TableOptions) -> Result<Vec<Column>> {
            Ok(Vec::new())
        }

        async fn structure(&self) -> Result<Vec<Structure>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopAdapter;

    #[async_trait]
    impl Adapter for NoopAdapter {
        async fn connect(&self, _url: &str) -> Result<Arc<dyn Driver>> {
            Ok(Arc::new(NoopDriver))
        }
    }

    #[test]
    fn test_adapter_registry_resolve() {
        let mut adapters = AdapterRegistry::new();
        adapters.register("noop", Arc::new(NoopAdapter));
        adapters.register("alt", Arc::new(NoopAdapter));

        assert!(adapters.resolve("noop").is_ok());
        assert!(adapters.has_backend("alt"));
        assert_eq!(adapters.backends(), vec!["alt", "noop"]);
        assert!(matches!(
            adapters.resolve("oracle"),
            Err(DataError::UnsupportedBackend(name)) if name == "oracle"
        ));
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = ConnectionRegistry::new(Arc::new(AdapterRegistry::new()));
        assert!(registry.ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_switching_unsupported_is_distinct_from_failure() {
        let mut adapters = AdapterRegistry::new();
        adapters.register("noop", Arc::new(NoopAdapter));
        let registry = ConnectionRegistry::new(Arc::new(adapters));

        registry.register("c1", "noop://", "noop").await.unwrap();

        assert!(!registry.supports_database_switching("c1").await.unwrap());
        assert!(matches!(
            registry.list_databases("c1").await,
            Err(DataError::UnsupportedCapability(_))
        ));
        assert!(matches!(
            registry.select_database("c1", "other").await,
            Err(DataError::UnsupportedCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_close_removes_connection() {
        let mut adapters = AdapterRegistry::new();
        adapters.register("noop", Arc::new(NoopAdapter));
        let registry = ConnectionRegistry::new(Arc::new(adapters));

        registry.register("c1", "noop://", "noop").await.unwrap();
        registry.close("c1").await.unwrap();

        assert!(matches!(
            registry.close("c1").await,
            Err(DataError::UnknownConnection(_))
        ));
        assert!(matches!(
            registry.structure("c1").await,
            Err(DataError::UnknownConnection(_))
        ));
    }
}

use crate::error::{DataError, Result};
use crate::stream::{PageSource, ResultStream};
use crate::types::Column;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Low-level handle to one open backend connection
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Run `query` and hand back its (possibly paged) result set
    async fn execute(&self, ctx: &CancellationToken, query: &str) -> Result<Box<dyn PageSource>>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Wraps the live connection a driver delegates to
///
/// The handle can be replaced while the driver keeps its identity. Every
/// operation works on its own snapshot of the handle, so a replacement never
/// pulls a connection out from under a running query.
pub struct Client<C: Connection> {
    conn: RwLock<Arc<C>>,
    switching: Mutex<()>,
}

impl<C: Connection> Client<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: RwLock::new(Arc::new(conn)),
            switching: Mutex::new(()),
        }
    }

    /// Snapshot of the current handle
    pub async fn connection(&self) -> Arc<C> {
        self.conn.read().await.clone()
    }

    /// Execute and stream pages lazily
    pub async fn query(&self, ctx: CancellationToken, query: &str) -> Result<ResultStream> {
        let conn = self.connection().await;
        let pages = conn.execute(&ctx, query).await?;
        Ok(ResultStream::from_pages(pages, ctx))
    }

    /// Execute and keep fetching pages until one carries rows or the backend
    /// reports end of data
    pub async fn query_until_not_empty(
        &self,
        ctx: CancellationToken,
        query: &str,
    ) -> Result<ResultStream> {
        let conn = self.connection().await;
        let pages = conn.execute(&ctx, query).await?;
        ResultStream::until_not_empty(pages, ctx).await
    }

    /// Run a query returning `(column_name, data_type)` rows and turn them
    /// into columns
    pub async fn columns_from_query(&self, query: &str) -> Result<Vec<Column>> {
        let mut rows = self
            .query_until_not_empty(CancellationToken::new(), query)
            .await?;

        let mut columns = Vec::new();
        while rows.has_next().await {
            let row = rows.next_row().await?;
            let (Some(name), Some(data_type)) = (
                row.first().and_then(|v| v.as_str()),
                row.get(1).and_then(|v| v.as_str()),
            ) else {
                return Err(DataError::backend_msg(format!(
                    "expected (name, type) string pair, got {:?}",
                    row
                )));
            };
            columns.push(Column::new(name, data_type));
        }

        Ok(columns)
    }

    /// Replace the live handle, then close the previous one
    pub async fn swap(&self, new: C) -> Result<()> {
        let old = {
            let mut conn = self.conn.write().await;
            std::mem::replace(&mut *conn, Arc::new(new))
        };

        debug!("Connection handle swapped, closing previous handle");
        old.close().await
    }

    /// Open a replacement handle and swap it in
    ///
    /// Concurrent switches are serialized. If `open` fails the current handle
    /// is left untouched.
    pub async fn switch_with<F, Fut>(&self, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<C>> + Send,
    {
        let _guard = self.switching.lock().await;

        let new = open().await?;

        let old = {
            let mut conn = self.conn.write().await;
            std::mem::replace(&mut *conn, Arc::new(new))
        };

        if let Err(e) = old.close().await {
            warn!("Failed to close previous connection after switch: {}", e);
        }

        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.connection().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticPages {
        columns: Vec<Column>,
        rows: Option<Vec<Row>>,
    }

    #[async_trait]
    impl PageSource for StaticPages {
        fn columns(&self) -> &[Column] {
            &self.columns
        }

        async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
            Ok(self.rows.take())
        }
    }

    struct TestConnection {
        label: &'static str,
        closed: Arc<AtomicBool>,
    }

    impl TestConnection {
        fn new(label: &'static str) -> Self {
            Self {
                label,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Connection for TestConnection {
        async fn execute(
            &self,
            _ctx: &CancellationToken,
            query: &str,
        ) -> Result<Box<dyn PageSource>> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DataError::backend_msg("connection closed"));
            }

            let rows = match query {
                "columns" => vec![
                    vec![json!("id"), json!("integer")],
                    vec![json!("name"), json!("text")],
                ],
                "broken columns" => vec![vec![json!(1)]],
                _ => vec![vec![json!(self.label)]],
            };

            Ok(Box::new(StaticPages {
                columns: vec![Column::new("value", "text")],
                rows: Some(rows),
            }))
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn first_value(client: &Client<TestConnection>) -> serde_json::Value {
        let mut rows = client
            .query(CancellationToken::new(), "select")
            .await
            .unwrap();
        rows.next_row().await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_swap_closes_previous_handle() {
        let first = TestConnection::new("first");
        let first_closed = first.closed.clone();
        let client = Client::new(first);

        assert_eq!(first_value(&client).await, json!("first"));

        client.swap(TestConnection::new("second")).await.unwrap();

        assert!(first_closed.load(Ordering::SeqCst));
        assert_eq!(first_value(&client).await, json!("second"));
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_current_handle() {
        let first = TestConnection::new("first");
        let first_closed = first.closed.clone();
        let client = Client::new(first);

        let result = client
            .switch_with(|| async { Err(DataError::ConnectionFailed("unreachable".into())) })
            .await;

        assert!(matches!(result, Err(DataError::ConnectionFailed(_))));
        assert!(!first_closed.load(Ordering::SeqCst));
        assert_eq!(first_value(&client).await, json!("first"));

        client
            .switch_with(|| async { Ok(TestConnection::new("second")) })
            .await
            .unwrap();
        assert!(first_closed.load(Ordering::SeqCst));
        assert_eq!(first_value(&client).await, json!("second"));
    }

    #[tokio::test]
    async fn test_in_flight_snapshot_survives_swap() {
        let client = Client::new(TestConnection::new("first"));
        let snapshot = client.connection().await;

        client.swap(TestConnection::new("second")).await.unwrap();

        assert_eq!(snapshot.label, "first");
        assert_eq!(client.connection().await.label, "second");
    }

    #[tokio::test]
    async fn test_columns_from_query() {
        let client = Client::new(TestConnection::new("c"));

        let columns = client.columns_from_query("columns").await.unwrap();
        assert_eq!(
            columns,
            vec![Column::new("id", "integer"), Column::new("name", "text")]
        );

        assert!(matches!(
            client.columns_from_query("broken columns").await,
            Err(DataError::BackendError { .. })
        ));
    }
}

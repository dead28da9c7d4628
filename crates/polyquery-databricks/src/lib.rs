//! Databricks SQL warehouse adapter for polyquery
//!
//! Statements run through the SQL Statement Execution REST API. Large results
//! come back in chunks which are fetched lazily while the caller pulls rows.
//!
//! Connection strings follow the Databricks DSN shape:
//!
//! ```text
//! token:<token>@<host>[:port]/sql/1.0/warehouses/<warehouse id>?catalog=<catalog>[&schema=<schema>]
//! ```
//!
//! Catalogs are switchable; `SHOW CATALOGS` lists them.

mod api;
pub mod config;

use api::{Api, ColumnInfo, ResultData, StatementRequest, StatementResponse, StatementState};
use async_trait::async_trait;
use polyquery::{
    extract_structure, Adapter, Client, Column, Connection, DataError, DatabaseList,
    DatabaseSwitcher, Driver, PageSource, Result, ResultStream, Row, Structure, StructureType,
    TableOptions,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub use config::DatabricksConfig;

/// Delay between polls of a pending statement
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Adapter registered under `databricks`
pub struct DatabricksAdapter;

#[async_trait]
impl Adapter for DatabricksAdapter {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Driver>> {
        let config = DatabricksConfig::parse(url)?;
        let conn = DatabricksConnection::open(config).await?;

        Ok(Arc::new(DatabricksDriver {
            client: Client::new(conn),
        }))
    }

    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String> {
        HashMap::from([
            (
                "List".to_string(),
                format!(
                    "SELECT * FROM {}.{} LIMIT 100;",
                    quote_ident(&opts.schema),
                    quote_ident(&opts.table)
                ),
            ),
            (
                "Columns".to_string(),
                format!(
                    "SELECT * FROM information_schema.columns WHERE table_schema = {} AND table_name = {};",
                    quote_literal(&opts.schema),
                    quote_literal(&opts.table)
                ),
            ),
        ])
    }
}

/// Warehouse session pinned to one catalog
pub struct DatabricksConnection {
    api: Api,
    config: DatabricksConfig,
}

impl DatabricksConnection {
    /// Build the API client and check that the warehouse is reachable
    pub async fn open(config: DatabricksConfig) -> Result<Self> {
        debug!(
            "Opening Databricks connection to warehouse {} (catalog {})",
            config.warehouse_id, config.catalog
        );

        let api = Api::new(&config.base_url, &config.token)?;

        let warehouse = api.get_warehouse(&config.warehouse_id).await.map_err(|e| {
            error!(
                "Failed to reach Databricks warehouse {}: {}",
                config.warehouse_id, e
            );
            DataError::ConnectionFailed(format!(
                "unable to reach warehouse {}: {}",
                config.warehouse_id, e
            ))
        })?;

        debug!(
            "Warehouse {} ({}) is {}",
            warehouse.id.as_deref().unwrap_or(&config.warehouse_id),
            warehouse.name.as_deref().unwrap_or("unnamed"),
            warehouse.state.as_deref().unwrap_or("in an unknown state")
        );

        Ok(Self { api, config })
    }

    pub fn catalog(&self) -> &str {
        &self.config.catalog
    }
}

#[async_trait]
impl Connection for DatabricksConnection {
    async fn execute(&self, ctx: &CancellationToken, query: &str) -> Result<Box<dyn PageSource>> {
        let request = StatementRequest::new(
            &self.config.warehouse_id,
            query,
            &self.config.catalog,
            self.config.schema.as_deref(),
        );

        let mut response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(DataError::Cancelled),
            response = self.api.submit(&request) => response?,
        };

        // Cancels the statement server-side if we stop waiting for it
        let mut guard = StatementGuard {
            api: self.api.clone(),
            id: response.statement_id.clone(),
        };

        loop {
            match response.status.state {
                StatementState::Succeeded => break,
                StatementState::Pending | StatementState::Running => {
                    let Some(id) = guard.id.clone() else {
                        return Err(DataError::backend_msg(
                            "pending statement has no statement_id",
                        ));
                    };

                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => return Err(DataError::Cancelled),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }

                    response = self.api.get_statement(&id).await?;
                }
                StatementState::Failed => {
                    guard.disarm();
                    let message = response
                        .status
                        .error
                        .map(|e| e.describe())
                        .unwrap_or_else(|| "unknown error".to_string());
                    error!("Databricks statement failed: {}", message);
                    return Err(DataError::backend_msg(message));
                }
                StatementState::Canceled | StatementState::Closed => {
                    guard.disarm();
                    return Err(DataError::backend_msg("statement was canceled"));
                }
                StatementState::Unknown => {
                    return Err(DataError::backend_msg("unexpected statement state"));
                }
            }
        }

        guard.disarm();
        Ok(Box::new(StatementPages::new(
            self.api.clone(),
            response.statement_id.clone().unwrap_or_default(),
            response,
        )))
    }

    async fn close(&self) -> Result<()> {
        debug!(
            "Closing Databricks connection to warehouse {}",
            self.config.warehouse_id
        );
        Ok(())
    }
}

struct StatementGuard {
    api: Api,
    id: Option<String>,
}

impl StatementGuard {
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for StatementGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.api.cancel_in_background(id);
        }
    }
}

/// Result chunks of a finished statement
struct StatementPages {
    api: Api,
    statement_id: String,
    columns: Vec<Column>,
    first: Option<Vec<Row>>,
    next_link: Option<String>,
}

impl StatementPages {
    fn new(api: Api, statement_id: String, response: StatementResponse) -> Self {
        let columns: Vec<Column> = response
            .manifest
            .unwrap_or_default()
            .schema
            .unwrap_or_default()
            .columns
            .into_iter()
            .map(column_from_info)
            .collect();

        let result = response.result.unwrap_or_default();
        let next_link = result.next_chunk_internal_link.clone();
        let first = chunk_rows(result, &columns);

        Self {
            api,
            statement_id,
            columns,
            first: Some(first),
            next_link,
        }
    }
}

#[async_trait]
impl PageSource for StatementPages {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        if let Some(rows) = self.first.take() {
            return Ok(Some(rows));
        }

        let Some(link) = self.next_link.take() else {
            return Ok(None);
        };

        debug!("Fetching result chunk {}", link);
        let chunk = self.api.get_chunk(&link).await?;
        self.next_link = chunk.next_chunk_internal_link.clone();

        Ok(Some(chunk_rows(chunk, &self.columns)))
    }
}

impl Drop for StatementPages {
    fn drop(&mut self) {
        // Chunks left unread
        if self.next_link.is_some() && !self.statement_id.is_empty() {
            self.api
                .cancel_in_background(std::mem::take(&mut self.statement_id));
        }
    }
}

/// Driver for one SQL warehouse
pub struct DatabricksDriver {
    client: Client<DatabricksConnection>,
}

#[async_trait]
impl Driver for DatabricksDriver {
    async fn query(&self, ctx: CancellationToken, query: &str) -> Result<ResultStream> {
        self.client.query_until_not_empty(ctx, query).await
    }

    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>> {
        self.client
            .columns_from_query(&format!(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
                quote_literal(&opts.schema),
                quote_literal(&opts.table)
            ))
            .await
    }

    async fn structure(&self) -> Result<Vec<Structure>> {
        // Query and catalog name come from the same handle
        let conn = self.client.connection().await;
        let query = format!(
            "SELECT table_schema, table_name, table_type \
             FROM system.information_schema.tables \
             WHERE table_catalog = {}",
            quote_literal(conn.catalog())
        );

        let ctx = CancellationToken::new();
        let pages = conn.execute(&ctx, &query).await?;
        let rows = ResultStream::until_not_empty(pages, ctx).await?;

        extract_structure(rows, structure_type).await
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn as_database_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        Some(self)
    }
}

#[async_trait]
impl DatabaseSwitcher for DatabricksDriver {
    async fn list_databases(&self) -> Result<DatabaseList> {
        let conn = self.client.connection().await;

        let ctx = CancellationToken::new();
        let pages = conn.execute(&ctx, "SHOW CATALOGS").await?;
        let rows = ResultStream::until_not_empty(pages, ctx)
            .await?
            .collect_rows()
            .await?;

        let available = rows
            .into_iter()
            .map(|row| match row.into_iter().next() {
                Some(Value::String(catalog)) => Ok(catalog),
                other => Err(DataError::backend_msg(format!(
                    "expected catalog name, got {:?}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DatabaseList {
            current: conn.catalog().to_string(),
            available,
        })
    }

    async fn select_database(&self, name: &str) -> Result<()> {
        let config = self.client.connection().await.config.with_catalog(name);

        self.client
            .switch_with(|| DatabricksConnection::open(config))
            .await
    }
}

/// Map an `information_schema.tables` type to a structure type
pub fn structure_type(typ: &str) -> StructureType {
    match typ {
        "TABLE" | "BASE TABLE" | "SYSTEM TABLE" => StructureType::Table,
        "VIEW" | "SYSTEM VIEW" => StructureType::View,
        "MATERIALIZED_VIEW" => StructureType::MaterializedView,
        "STREAMING_TABLE" => StructureType::StreamingTable,
        "MANAGED" => StructureType::Managed,
        _ => StructureType::None,
    }
}

fn column_from_info(info: ColumnInfo) -> Column {
    let data_type = info
        .type_name
        .or(info.type_text)
        .unwrap_or_else(|| "STRING".to_string());
    Column::new(info.name, data_type)
}

fn chunk_rows(chunk: ResultData, columns: &[Column]) -> Vec<Row> {
    chunk
        .data_array
        .unwrap_or_default()
        .into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(i, cell)| {
                    let data_type = columns.get(i).map(|c| c.data_type.as_str());
                    convert_value(cell, data_type.unwrap_or("STRING"))
                })
                .collect()
        })
        .collect()
}

/// Convert a `JSON_ARRAY` cell, which always arrives as a string, by its
/// column type name
fn convert_value(cell: Option<String>, type_name: &str) -> Value {
    let Some(text) = cell else {
        return Value::Null;
    };

    match type_name {
        "BOOLEAN" => text
            .parse::<bool>()
            .map(Value::Bool)
            .unwrap_or(Value::String(text)),
        "BYTE" | "SHORT" | "INT" | "LONG" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "FLOAT" | "DOUBLE" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
        "ARRAY" | "MAP" | "STRUCT" => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        // DECIMAL stays textual to keep its precision
        _ => Value::String(text),
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structure_type_mapping() {
        assert_eq!(structure_type("BASE TABLE"), StructureType::Table);
        assert_eq!(structure_type("SYSTEM VIEW"), StructureType::View);
        assert_eq!(
            structure_type("MATERIALIZED_VIEW"),
            StructureType::MaterializedView
        );
        assert_eq!(
            structure_type("STREAMING_TABLE"),
            StructureType::StreamingTable
        );
        assert_eq!(structure_type("MANAGED"), StructureType::Managed);
        assert_eq!(structure_type("EXTERNAL"), StructureType::None);
    }

    #[test]
    fn test_convert_value() {
        assert_eq!(convert_value(None, "INT"), Value::Null);
        assert_eq!(convert_value(Some("42".into()), "LONG"), json!(42));
        assert_eq!(convert_value(Some("1.5".into()), "DOUBLE"), json!(1.5));
        assert_eq!(convert_value(Some("true".into()), "BOOLEAN"), json!(true));
        assert_eq!(
            convert_value(Some("12.3400".into()), "DECIMAL"),
            json!("12.3400")
        );
        assert_eq!(
            convert_value(Some("[1,2]".into()), "ARRAY"),
            json!([1, 2])
        );
        assert_eq!(
            convert_value(Some("not a number".into()), "INT"),
            json!("not a number")
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_literal("it's"), "'it\\'s'");
        assert_eq!(quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn test_helpers() {
        let helpers = DatabricksAdapter.helpers(&TableOptions::new("sales", "orders"));
        assert_eq!(helpers["List"], "SELECT * FROM `sales`.`orders` LIMIT 100;");
        assert!(helpers["Columns"].contains("table_name = 'orders'"));
    }
}

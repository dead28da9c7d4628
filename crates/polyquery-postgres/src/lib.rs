//! PostgreSQL adapter for polyquery
//!
//! Rows are streamed straight off the wire through `query_raw` and handed out
//! in fixed-size pages. Switching databases reconnects with a different
//! `dbname`, everything else in the connection config is kept.

use async_trait::async_trait;
use futures::stream::{Fuse, FusedStream};
use futures::{Stream, StreamExt};
use polyquery::{
    extract_structure, Adapter, Client, Column, Connection, DataError, DatabaseList,
    DatabaseSwitcher, Driver, PageSource, Result, ResultStream, Row, Structure, StructureType,
    TableOptions,
};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Config, NoTls, RowStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Rows per page pulled off a row stream
const PAGE_SIZE: usize = 500;

const STRUCTURE_QUERY: &str = r#"
    SELECT table_schema::text, table_name::text, table_type::text
    FROM information_schema.tables
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
    UNION ALL
    SELECT schemaname::text, matviewname::text, 'MATERIALIZED VIEW'
    FROM pg_matviews
    ORDER BY 1, 2
"#;

const DATABASES_QUERY: &str = r#"
    SELECT datname::text
    FROM pg_database
    WHERE datistemplate = false AND datallowconn = true
    ORDER BY datname
"#;

/// Adapter registered under `postgres`
pub struct PostgresAdapter;

#[async_trait]
impl Adapter for PostgresAdapter {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Driver>> {
        let config: Config = url.parse().map_err(|e| {
            DataError::invalid_connection_string(format!(
                "failed to parse PostgreSQL connection string: {}",
                e
            ))
        })?;

        let conn = PostgresConnection::open(config).await?;

        Ok(Arc::new(PostgresDriver {
            client: Client::new(conn),
        }))
    }

    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String> {
        let schema = quote_literal(&opts.schema);
        let table = quote_literal(&opts.table);

        HashMap::from([
            (
                "List".to_string(),
                format!(
                    "SELECT * FROM {}.{} LIMIT 500",
                    quote_ident(&opts.schema),
                    quote_ident(&opts.table)
                ),
            ),
            (
                "Columns".to_string(),
                format!(
                    "SELECT * FROM information_schema.columns \
                     WHERE table_schema = {} AND table_name = {}",
                    schema, table
                ),
            ),
            (
                "Indexes".to_string(),
                format!(
                    "SELECT * FROM pg_indexes WHERE schemaname = {} AND tablename = {}",
                    schema, table
                ),
            ),
            (
                "Foreign Keys".to_string(),
                format!(
                    "SELECT tc.constraint_name, kcu.column_name, \
                     ccu.table_schema AS foreign_table_schema, \
                     ccu.table_name AS foreign_table_name, \
                     ccu.column_name AS foreign_column_name \
                     FROM information_schema.table_constraints AS tc \
                     JOIN information_schema.key_column_usage AS kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                       AND tc.table_schema = kcu.table_schema \
                     JOIN information_schema.constraint_column_usage AS ccu \
                       ON ccu.constraint_name = tc.constraint_name \
                     WHERE tc.constraint_type = 'FOREIGN KEY' \
                       AND tc.table_schema = {} AND tc.table_name = {}",
                    schema, table
                ),
            ),
        ])
    }
}

/// One live PostgreSQL session plus the config it was opened with
pub struct PostgresConnection {
    client: tokio_postgres::Client,
    config: Config,
    database: String,
}

impl PostgresConnection {
    pub async fn open(config: Config) -> Result<Self> {
        let database = config
            .get_dbname()
            .or_else(|| config.get_user())
            .unwrap_or("postgres")
            .to_string();

        debug!("Connecting to PostgreSQL database: {}", database);

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            let message = error_message(&e);
            error!("PostgreSQL connection failed: {}", message);
            DataError::ConnectionFailed(format!("PostgreSQL connection failed: {}", message))
        })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Successfully connected to PostgreSQL database: {}", database);

        Ok(Self {
            client,
            config,
            database,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&self, ctx: &CancellationToken, query: &str) -> Result<Box<dyn PageSource>> {
        debug!("Executing SQL: {}", query);

        let run = async {
            let statement = self
                .client
                .prepare(query)
                .await
                .map_err(|e| query_error(query, e))?;

            let columns: Vec<Column> = statement
                .columns()
                .iter()
                .map(|c| Column::new(c.name(), c.type_().name()))
                .collect();

            let rows = self
                .client
                .query_raw(&statement, Vec::<String>::new())
                .await
                .map_err(|e| query_error(query, e))?;

            Ok::<_, DataError>((columns, rows))
        };

        let (columns, rows) = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                let token = self.client.cancel_token();
                tokio::spawn(async move {
                    if let Err(e) = token.cancel_query(NoTls).await {
                        error!("Failed to cancel PostgreSQL query: {}", e);
                    }
                });
                return Err(DataError::Cancelled);
            }
            result = run => result?,
        };

        Ok(Box::new(PostgresPages {
            columns,
            rows: Box::pin(rows).fuse(),
        }))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing PostgreSQL connection to {}", self.database);
        // Session ends once the last handle to the client is dropped
        Ok(())
    }
}

struct PostgresPages {
    columns: Vec<Column>,
    // RowStream errors if polled again after it ended
    rows: Fuse<Pin<Box<RowStream>>>,
}

#[async_trait]
impl PageSource for PostgresPages {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        let rows = next_chunk(&mut self.rows, PAGE_SIZE).await.map_err(|e| {
            error!("PostgreSQL row stream failed: {}", e);
            DataError::backend("failed to read row", e)
        })?;

        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.iter().map(row_values).collect()))
        }
    }
}

/// Pull up to `size` items; a short chunk means the stream has ended
async fn next_chunk<S, T, E>(rows: &mut S, size: usize) -> std::result::Result<Vec<T>, E>
where
    S: Stream<Item = std::result::Result<T, E>> + FusedStream + Unpin,
{
    let mut chunk = Vec::new();

    while chunk.len() < size {
        match rows.next().await {
            Some(item) => chunk.push(item?),
            None => break,
        }
    }

    Ok(chunk)
}

/// Driver over one PostgreSQL database
pub struct PostgresDriver {
    client: Client<PostgresConnection>,
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn query(&self, ctx: CancellationToken, query: &str) -> Result<ResultStream> {
        self.client.query(ctx, query).await
    }

    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>> {
        self.client
            .columns_from_query(&format!(
                "SELECT column_name::text, data_type::text \
                 FROM information_schema.columns \
                 WHERE table_schema = {} AND table_name = {} \
                 ORDER BY ordinal_position",
                quote_literal(&opts.schema),
                quote_literal(&opts.table)
            ))
            .await
    }

    async fn structure(&self) -> Result<Vec<Structure>> {
        let rows = self
            .client
            .query(CancellationToken::new(), STRUCTURE_QUERY)
            .await?;
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
impl DatabaseSwitcher for PostgresDriver {
    async fn list_databases(&self) -> Result<DatabaseList> {
        let current = self.client.connection().await.database().to_string();

        let mut rows = self
            .client
            .query(CancellationToken::new(), DATABASES_QUERY)
            .await?;

        let mut available = Vec::new();
        while rows.has_next().await {
            let row = rows.next_row().await?;
            match row.first().and_then(|v| v.as_str()) {
                Some(name) => available.push(name.to_string()),
                None => {
                    return Err(DataError::backend_msg(format!(
                        "expected database name, got {:?}",
                        row
                    )))
                }
            }
        }

        Ok(DatabaseList { current, available })
    }

    async fn select_database(&self, name: &str) -> Result<()> {
        let mut config = self.client.connection().await.config.clone();
        config.dbname(name);

        self.client
            .switch_with(|| PostgresConnection::open(config))
            .await
    }
}

/// Map `information_schema.tables.table_type` (plus our materialized view
/// marker) to a structure type
pub fn structure_type(typ: &str) -> StructureType {
    match typ {
        "BASE TABLE" | "LOCAL TEMPORARY" | "FOREIGN" => StructureType::Table,
        "VIEW" => StructureType::View,
        "MATERIALIZED VIEW" => StructureType::MaterializedView,
        _ => StructureType::None,
    }
}

fn query_error(query: &str, e: tokio_postgres::Error) -> DataError {
    error!("PostgreSQL query failed: {}", e);
    error!("Failed SQL: {}", query);

    DataError::backend(error_message(&e), e)
}

/// Server message with detail and hint when the error came from the database
fn error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db_error) => {
            let mut msg = db_error.message().to_string();

            if let Some(detail) = db_error.detail() {
                msg.push_str(&format!("\nDetail: {}", detail));
            }

            if let Some(hint) = db_error.hint() {
                msg.push_str(&format!("\nHint: {}", hint));
            }

            msg
        }
        None => e.to_string(),
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Convert a PostgreSQL row into positional JSON scalars
fn row_values(row: &tokio_postgres::Row) -> Row {
    (0..row.len()).map(|idx| extract_value(row, idx)).collect()
}

fn extract_value(row: &tokio_postgres::Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_();

    match ty.kind() {
        Kind::Array(element) => array_value(row, idx, element),
        _ => scalar_value(row, idx, ty),
    }
}

fn scalar_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    match ty.name() {
        "bool" => get_or_raw(row, idx, Value::Bool),
        "int2" => get_or_raw(row, idx, |v: i16| Value::from(v)),
        "int4" => get_or_raw(row, idx, |v: i32| Value::from(v)),
        "int8" => get_or_raw(row, idx, |v: i64| Value::from(v)),
        "oid" => get_or_raw(row, idx, |v: u32| Value::from(v)),
        "float4" => get_or_raw(row, idx, |v: f32| float_value(v as f64)),
        "float8" => get_or_raw(row, idx, float_value),
        "numeric" => get_or_raw(row, idx, decimal_value),
        "date" => get_or_raw(row, idx, |v: chrono::NaiveDate| Value::String(v.to_string())),
        "time" => get_or_raw(row, idx, |v: chrono::NaiveTime| Value::String(v.to_string())),
        "timestamp" => get_or_raw(row, idx, |v: chrono::NaiveDateTime| {
            Value::String(v.to_string())
        }),
        "timestamptz" => get_or_raw(row, idx, |v: chrono::DateTime<chrono::Utc>| {
            Value::String(v.to_rfc3339())
        }),
        "interval" => get_or_raw(row, idx, |v: Interval| Value::String(v.to_string())),
        "json" | "jsonb" => get_or_raw(row, idx, |v: Value| v),
        "uuid" => get_or_raw(row, idx, |v: uuid::Uuid| Value::String(v.to_string())),
        "bytea" => get_or_raw(row, idx, |v: Vec<u8>| Value::String(bytea_text(&v))),
        "inet" => get_or_raw(row, idx, |v: std::net::IpAddr| Value::String(v.to_string())),
        _ => get_or_raw(row, idx, Value::String),
    }
}

fn array_value(row: &tokio_postgres::Row, idx: usize, element: &Type) -> Value {
    match element.name() {
        "bool" => get_or_raw(row, idx, |v: Vec<Option<bool>>| json_array(v, Value::Bool)),
        "int2" => get_or_raw(row, idx, |v: Vec<Option<i16>>| json_array(v, Value::from)),
        "int4" => get_or_raw(row, idx, |v: Vec<Option<i32>>| json_array(v, Value::from)),
        "int8" => get_or_raw(row, idx, |v: Vec<Option<i64>>| json_array(v, Value::from)),
        "oid" => get_or_raw(row, idx, |v: Vec<Option<u32>>| json_array(v, Value::from)),
        "float4" => get_or_raw(row, idx, |v: Vec<Option<f32>>| {
            json_array(v, |f| float_value(f as f64))
        }),
        "float8" => get_or_raw(row, idx, |v: Vec<Option<f64>>| json_array(v, float_value)),
        "numeric" => get_or_raw(row, idx, |v: Vec<Option<rust_decimal::Decimal>>| {
            json_array(v, decimal_value)
        }),
        "text" | "varchar" | "bpchar" | "name" => {
            get_or_raw(row, idx, |v: Vec<Option<String>>| json_array(v, Value::String))
        }
        "uuid" => get_or_raw(row, idx, |v: Vec<Option<uuid::Uuid>>| {
            json_array(v, |u| Value::String(u.to_string()))
        }),
        "json" | "jsonb" => get_or_raw(row, idx, |v: Vec<Option<Value>>| json_array(v, |j| j)),
        "date" => get_or_raw(row, idx, |v: Vec<Option<chrono::NaiveDate>>| {
            json_array(v, |d| Value::String(d.to_string()))
        }),
        "timestamp" => get_or_raw(row, idx, |v: Vec<Option<chrono::NaiveDateTime>>| {
            json_array(v, |t| Value::String(t.to_string()))
        }),
        "timestamptz" => get_or_raw(row, idx, |v: Vec<Option<chrono::DateTime<chrono::Utc>>>| {
            json_array(v, |t| Value::String(t.to_rfc3339()))
        }),
        _ => raw_value(row, idx),
    }
}

/// Decode a column as `T`, falling back to its raw bytes when the type does not match
fn get_or_raw<'a, T, F>(row: &'a tokio_postgres::Row, idx: usize, convert: F) -> Value
where
    T: FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(value)) => convert(value),
        Ok(None) => Value::Null,
        Err(e) => {
            debug!("Decoding column {} as raw bytes: {}", idx, e);
            raw_value(row, idx)
        }
    }
}

fn raw_value(row: &tokio_postgres::Row, idx: usize) -> Value {
    match row.try_get::<_, Option<RawValue>>(idx) {
        Ok(Some(RawValue(bytes))) => raw_json(&bytes),
        Ok(None) => Value::Null,
        Err(e) => {
            error!("Failed to read column {}: {}", idx, e);
            Value::Null
        }
    }
}

/// Printable UTF-8 stays text, anything else is rendered as bytea hex
fn raw_json(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) => {
            Value::String(text.to_string())
        }
        _ => Value::String(bytea_text(bytes)),
    }
}

fn bytea_text(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

// Kept as a string so scale and precision survive
fn decimal_value(v: rust_decimal::Decimal) -> Value {
    Value::String(v.to_string())
}

fn json_array<T>(items: Vec<Option<T>>, convert: impl Fn(T) -> Value) -> Value {
    Value::Array(
        items
            .into_iter()
            .map(|item| item.map(&convert).unwrap_or(Value::Null))
            .collect(),
    )
}

/// Undecoded column bytes in the wire format
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// PostgreSQL interval in its binary layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    months: i32,
    days: i32,
    micros: i64,
}

impl<'a> FromSql<'a> for Interval {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() != 16 {
            return Err(format!("invalid interval length {}", raw.len()).into());
        }

        let mut micros = [0u8; 8];
        let mut days = [0u8; 4];
        let mut months = [0u8; 4];
        micros.copy_from_slice(&raw[0..8]);
        days.copy_from_slice(&raw[8..12]);
        months.copy_from_slice(&raw[12..16]);

        Ok(Interval {
            months: i32::from_be_bytes(months),
            days: i32::from_be_bytes(days),
            micros: i64::from_be_bytes(micros),
        })
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}

impl std::fmt::Display for Interval {
    /// Same layout as the server's default `postgres` interval style
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn unit(value: i64, name: &str) -> String {
            if value == 1 || value == -1 {
                format!("{} {}", value, name)
            } else {
                format!("{} {}s", value, name)
            }
        }

        let mut parts = Vec::new();
        let years = self.months / 12;
        let months = self.months % 12;

        if years != 0 {
            parts.push(unit(years as i64, "year"));
        }
        if months != 0 {
            parts.push(unit(months as i64, "mon"));
        }
        if self.days != 0 {
            parts.push(unit(self.days as i64, "day"));
        }

        if self.micros != 0 || parts.is_empty() {
            let sign = if self.micros < 0 { "-" } else { "" };
            let total = self.micros.unsigned_abs();
            let seconds = total / 1_000_000;
            let fraction = total % 1_000_000;

            let mut time = format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                seconds / 3600,
                (seconds / 60) % 60,
                seconds % 60
            );
            if fraction != 0 {
                let digits = format!("{:06}", fraction);
                time.push('.');
                time.push_str(digits.trim_end_matches('0'));
            }
            parts.push(time);
        }

        write!(f, "{}", parts.join(" "))
    }
}

//! Redis adapter for polyquery
//!
//! ## Catalogs
//!
//! Redis logical databases (`0`, `1`, ...) are the catalogs; the index in the
//! connection URL is the current one. Structure lists the keys of the current
//! database as a single namespace, walked with `SCAN`.
//!
//! ## Queries
//!
//! The query text is a raw command line, e.g. `HGETALL "user:1"`. Replies
//! are rendered as rows: scalars as one `reply` row, arrays as `index, value`
//! rows and maps as `field, value` rows.
//!
//! ```rust,no_run
//! use polyquery::Adapter;
//! use polyquery_redis::RedisAdapter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> polyquery::Result<()> {
//! let driver = RedisAdapter.connect("redis://localhost:6379/0").await?;
//! let rows = driver
//!     .query(CancellationToken::new(), "KEYS user:*")
//!     .await?
//!     .collect_rows()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use polyquery::{
    extract_structure, Adapter, Client, Column, Connection, DataError, DatabaseList,
    DatabaseSwitcher, Driver, PageSource, Result, ResultStream, Row, Structure, StructureType,
    TableOptions,
};
use redis::aio::ConnectionManager;
use redis::{ConnectionInfo, IntoConnectionInfo, RedisError};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Keys requested per `SCAN` round trip
const SCAN_COUNT: usize = 500;

/// Upper bound on keys listed by `structure`
const MAX_STRUCTURE_KEYS: usize = 10_000;

/// Fallback when `CONFIG GET databases` is not permitted
const DEFAULT_DATABASES: i64 = 16;

/// Adapter registered under `redis`
pub struct RedisAdapter;

#[async_trait]
impl Adapter for RedisAdapter {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Driver>> {
        let info = url.into_connection_info().map_err(|e| {
            DataError::invalid_connection_string(format!("invalid Redis URL: {}", e))
        })?;

        let conn = RedisConnection::open(info).await?;

        Ok(Arc::new(RedisDriver {
            client: Client::new(conn),
        }))
    }

    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String> {
        let key = quote_arg(&opts.table);

        HashMap::from([
            ("Get".to_string(), format!("GET {}", key)),
            ("Type".to_string(), format!("TYPE {}", key)),
            ("TTL".to_string(), format!("TTL {}", key)),
        ])
    }
}

/// Connection manager bound to one logical database
pub struct RedisConnection {
    manager: ConnectionManager,
    info: ConnectionInfo,
}

impl RedisConnection {
    pub async fn open(info: ConnectionInfo) -> Result<Self> {
        debug!("Creating Redis connection for database {}", info.redis.db);

        let client = redis::Client::open(info.clone()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            DataError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            DataError::ConnectionFailed(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self { manager, info })
    }

    pub fn database(&self) -> i64 {
        self.info.redis.db
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn execute(&self, ctx: &CancellationToken, query: &str) -> Result<Box<dyn PageSource>> {
        let args = split_command(query)?;
        let Some((name, rest)) = args.split_first() else {
            return Err(DataError::InvalidQuery("empty command".to_string()));
        };

        debug!("Executing Redis command: {}", name);

        let mut cmd = redis::cmd(name);
        for arg in rest {
            cmd.arg(arg);
        }

        let mut conn = self.manager.clone();
        let reply: redis::Value = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(DataError::Cancelled),
            reply = cmd.query_async(&mut conn) => reply.map_err(|e: RedisError| {
                error!("Redis command {} failed: {}", name, e);
                DataError::backend(format!("command {} failed", name), e)
            })?,
        };

        let (columns, rows) = reply_rows(reply);
        Ok(Box::new(ReplyPage {
            columns,
            rows: Some(rows),
        }))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing Redis connection to database {}", self.database());
        // Connection manager handles cleanup automatically
        Ok(())
    }
}

/// A fully materialized reply, handed out as a single page
struct ReplyPage {
    columns: Vec<Column>,
    rows: Option<Vec<Row>>,
}

#[async_trait]
impl PageSource for ReplyPage {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        Ok(self.rows.take())
    }
}

/// `SCAN` cursor walk yielding `(database, key, type)` rows
///
/// `SCAN` may return empty batches before the cursor wraps around; those
/// surface as empty pages. Keys reported more than once by the cursor are
/// emitted only the first time.
struct ScanPages {
    conn: ConnectionManager,
    database: String,
    cursor: Option<u64>,
    seen: HashSet<String>,
    columns: Vec<Column>,
}

impl ScanPages {
    fn new(conn: ConnectionManager, database: i64) -> Self {
        Self {
            conn,
            database: database.to_string(),
            cursor: Some(0),
            seen: HashSet::new(),
            columns: vec![
                Column::new("database", "string"),
                Column::new("key", "string"),
                Column::new("type", "string"),
            ],
        }
    }
}

#[async_trait]
impl PageSource for ScanPages {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };

        if self.seen.len() >= MAX_STRUCTURE_KEYS {
            warn!(
                "Database {} has more than {} keys, structure is truncated",
                self.database, MAX_STRUCTURE_KEYS
            );
            self.cursor = None;
            return Ok(None);
        }

        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(&mut self.conn)
            .await
            .map_err(|e: RedisError| {
                error!("Failed to scan keys: {}", e);
                DataError::backend("failed to scan keys", e)
            })?;

        self.cursor = (next != 0).then_some(next);

        let budget = MAX_STRUCTURE_KEYS - self.seen.len();
        let keys = fresh_keys(&mut self.seen, keys, budget);

        if keys.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("TYPE").arg(key);
        }
        let types: Vec<String> = pipe
            .query_async(&mut self.conn)
            .await
            .map_err(|e: RedisError| {
                error!("Failed to get key types: {}", e);
                DataError::backend("failed to get key types", e)
            })?;

        Ok(Some(
            keys.into_iter()
                .zip(types)
                .map(|(key, typ)| vec![json!(self.database), json!(key), json!(typ)])
                .collect(),
        ))
    }
}

/// Keys of `batch` not already in `seen`, at most `budget` of them
fn fresh_keys(seen: &mut HashSet<String>, batch: Vec<String>, budget: usize) -> Vec<String> {
    let mut fresh = Vec::new();

    for key in batch {
        if fresh.len() >= budget {
            break;
        }
        if seen.insert(key.clone()) {
            fresh.push(key);
        }
    }

    fresh
}

/// Driver over one Redis logical database
pub struct RedisDriver {
    client: Client<RedisConnection>,
}

#[async_trait]
impl Driver for RedisDriver {
    async fn query(&self, ctx: CancellationToken, query: &str) -> Result<ResultStream> {
        self.client.query(ctx, query).await
    }

    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>> {
        let conn = self.client.connection().await;
        let mut manager = conn.manager.clone();

        let key_type: String = redis::cmd("TYPE")
            .arg(&opts.table)
            .query_async(&mut manager)
            .await
            .map_err(|e: RedisError| {
                error!("Failed to get key type: {}", e);
                DataError::backend("failed to get key type", e)
            })?;

        if key_type == "none" {
            return Err(DataError::backend_msg(format!(
                "key '{}' not found in database {}",
                opts.table,
                conn.database()
            )));
        }

        Ok(vec![
            Column::new("key", "string"),
            Column::new("type", "string"),
            Column::new("ttl", "int64"),
            Column::new("value", key_type),
        ])
    }

    async fn structure(&self) -> Result<Vec<Structure>> {
        let conn = self.client.connection().await;
        let pages = ScanPages::new(conn.manager.clone(), conn.database());

        let rows = ResultStream::from_pages(Box::new(pages), CancellationToken::new());
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
impl DatabaseSwitcher for RedisDriver {
    async fn list_databases(&self) -> Result<DatabaseList> {
        let conn = self.client.connection().await;
        let mut manager = conn.manager.clone();

        let config: std::result::Result<HashMap<String, String>, RedisError> =
            redis::cmd("CONFIG")
                .arg("GET")
                .arg("databases")
                .query_async(&mut manager)
                .await;

        let count = match config {
            Ok(config) => config
                .get("databases")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DATABASES),
            Err(e) => {
                debug!("CONFIG GET databases unavailable, assuming {}: {}", DEFAULT_DATABASES, e);
                DEFAULT_DATABASES
            }
        };

        Ok(DatabaseList {
            current: conn.database().to_string(),
            available: (0..count).map(|db| db.to_string()).collect(),
        })
    }

    async fn select_database(&self, name: &str) -> Result<()> {
        let db: i64 = name.parse().map_err(|_| {
            DataError::InvalidQuery(format!(
                "Invalid database number '{}'",
                name
            ))
        })?;

        let mut info = self.client.connection().await.info.clone();
        info.redis.db = db;

        self.client
            .switch_with(|| RedisConnection::open(info))
            .await
    }
}

/// Map a Redis `TYPE` reply to a structure type
pub fn structure_type(typ: &str) -> StructureType {
    match typ {
        "string" | "hash" | "list" | "set" | "zset" => StructureType::Table,
        "stream" => StructureType::StreamingTable,
        _ => StructureType::None,
    }
}

/// Split a command line into arguments, honouring single and double quotes
fn split_command(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('"'), '\\') => match chars.next() {
                Some('n') => current.push('\n'),
                Some('t') => current.push('\t'),
                Some(other) => current.push(other),
                None => break,
            },
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }

    if quote.is_some() {
        return Err(DataError::InvalidQuery(
            "unterminated quote in command".to_string(),
        ));
    }
    if in_arg {
        args.push(current);
    }

    Ok(args)
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render a reply as columns and rows
fn reply_rows(reply: redis::Value) -> (Vec<Column>, Vec<Row>) {
    match reply {
        redis::Value::Array(items) | redis::Value::Set(items) => (
            vec![Column::new("index", "int64"), Column::new("value", "string")],
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| vec![json!(i), value_to_json(v)])
                .collect(),
        ),
        redis::Value::Map(pairs) => (
            vec![Column::new("field", "string"), Column::new("value", "string")],
            pairs
                .into_iter()
                .map(|(k, v)| vec![value_to_json(k), value_to_json(v)])
                .collect(),
        ),
        other => (
            vec![Column::new("reply", "string")],
            vec![vec![value_to_json(other)]],
        ),
    }
}

fn value_to_json(value: redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(n) => json!(n),
        redis::Value::BulkString(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::SimpleString(s) => Value::String(s),
        redis::Value::Okay => Value::String("OK".to_string()),
        redis::Value::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        redis::Value::Boolean(b) => Value::Bool(b),
        redis::Value::VerbatimString { text, .. } => Value::String(text),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::Array(items.into_iter().map(value_to_json).collect())
        }
        redis::Value::Map(pairs) => Value::Object(
            pairs
                .into_iter()
                .map(|(k, v)| {
                    let key = match value_to_json(k) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, value_to_json(v))
                })
                .collect(),
        ),
        other => Value::String(format!("{:?}", other)),
    }
}

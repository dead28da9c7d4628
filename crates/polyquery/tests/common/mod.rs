//! In-memory backend used by the integration tests
//!
//! Connection strings look like `memory://<catalog>?page_size=<n>&fail_close=true`.
//! A query is the name of a table in the current catalog; `__structure`
//! returns the catalog's `(schema, name, kind)` listing.

#![allow(dead_code)]

use async_trait::async_trait;
use polyquery::{
    extract_structure, Adapter, Client, Column, Connection, DataError, DatabaseList,
    DatabaseSwitcher, Driver, PageSource, Result, ResultStream, Row, Structure, StructureType,
    TableOptions,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const STRUCTURE_QUERY: &str = "__structure";

#[derive(Default)]
pub struct Catalog {
    pub objects: Vec<(String, String, String)>,
    pub tables: HashMap<String, (Vec<Column>, Vec<Row>)>,
}

impl Catalog {
    pub fn object(mut self, schema: &str, name: &str, kind: &str) -> Self {
        self.objects
            .push((schema.to_string(), name.to_string(), kind.to_string()));
        self
    }

    pub fn numbers(mut self, name: &str, range: std::ops::Range<i64>) -> Self {
        let rows = range.map(|n| vec![json!(n)]).collect();
        self.tables
            .insert(name.to_string(), (vec![Column::new("n", "bigint")], rows));
        self
    }
}

#[derive(Default)]
pub struct MemoryServer {
    pub catalogs: HashMap<String, Catalog>,
    pub unreachable: HashSet<String>,
}

impl MemoryServer {
    pub fn catalog(mut self, name: &str, catalog: Catalog) -> Self {
        self.catalogs.insert(name.to_string(), catalog);
        self
    }

    pub fn unreachable(mut self, name: &str) -> Self {
        self.unreachable.insert(name.to_string());
        self
    }
}

/// Server with a `main` catalog, an `analytics` catalog and an unreachable
/// `offline` catalog
pub fn sample_server() -> Arc<MemoryServer> {
    Arc::new(
        MemoryServer::default()
            .catalog(
                "main",
                Catalog::default()
                    .object("public", "users", "TABLE")
                    .object("ops", "jobs", "BASE TABLE")
                    .object("public", "v1", "VIEW")
                    .numbers("numbers", 0..25),
            )
            .catalog(
                "analytics",
                Catalog::default()
                    .object("events", "clicks", "TABLE")
                    .numbers("numbers", 100..103),
            )
            .catalog("offline", Catalog::default())
            .unreachable("offline"),
    )
}

pub fn classify(kind: &str) -> StructureType {
    match kind {
        "TABLE" => StructureType::Table,
        "VIEW" => StructureType::View,
        _ => StructureType::None,
    }
}

struct MemoryPages {
    columns: Vec<Column>,
    pages: VecDeque<Vec<Row>>,
}

#[async_trait]
impl PageSource for MemoryPages {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        Ok(self.pages.pop_front())
    }
}

pub struct MemoryConnection {
    server: Arc<MemoryServer>,
    pub catalog: String,
    page_size: usize,
    fail_close: bool,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn open(
        server: Arc<MemoryServer>,
        catalog: &str,
        page_size: usize,
        fail_close: bool,
    ) -> Result<Self> {
        if server.unreachable.contains(catalog) || !server.catalogs.contains_key(catalog) {
            return Err(DataError::ConnectionFailed(format!(
                "catalog {} is unreachable",
                catalog
            )));
        }

        Ok(Self {
            server,
            catalog: catalog.to_string(),
            page_size,
            fail_close,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, _ctx: &CancellationToken, query: &str) -> Result<Box<dyn PageSource>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataError::backend_msg("connection is closed"));
        }

        let catalog = &self.server.catalogs[&self.catalog];

        let (columns, rows) = if query == STRUCTURE_QUERY {
            let columns = vec![
                Column::new("schema", "text"),
                Column::new("name", "text"),
                Column::new("kind", "text"),
            ];
            let rows = catalog
                .objects
                .iter()
                .map(|(s, n, k)| vec![json!(s), json!(n), json!(k)])
                .collect();
            (columns, rows)
        } else {
            catalog
                .tables
                .get(query)
                .cloned()
                .ok_or_else(|| DataError::backend_msg(format!("no such table: {}", query)))?
        };

        Ok(Box::new(MemoryPages {
            columns,
            pages: rows
                .chunks(self.page_size)
                .map(|chunk| chunk.to_vec())
                .collect(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(DataError::backend_msg("close refused"));
        }
        Ok(())
    }
}

pub struct MemoryDriver {
    server: Arc<MemoryServer>,
    client: Client<MemoryConnection>,
    page_size: usize,
    fail_close: bool,
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn query(&self, ctx: CancellationToken, query: &str) -> Result<ResultStream> {
        self.client.query_until_not_empty(ctx, query).await
    }

    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>> {
        let conn = self.client.connection().await;
        conn.server.catalogs[&conn.catalog]
            .tables
            .get(&opts.table)
            .map(|(columns, _)| columns.clone())
            .ok_or_else(|| DataError::backend_msg(format!("no such table: {}", opts)))
    }

    async fn structure(&self) -> Result<Vec<Structure>> {
        let rows = self
            .client
            .query(CancellationToken::new(), STRUCTURE_QUERY)
            .await?;
        extract_structure(rows, classify).await
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn as_database_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        Some(self)
    }
}

#[async_trait]
impl DatabaseSwitcher for MemoryDriver {
    async fn list_databases(&self) -> Result<DatabaseList> {
        let mut available: Vec<String> = self.server.catalogs.keys().cloned().collect();
        available.sort();

        Ok(DatabaseList {
            current: self.client.connection().await.catalog.clone(),
            available,
        })
    }

    async fn select_database(&self, name: &str) -> Result<()> {
        let server = self.server.clone();
        let (page_size, fail_close) = (self.page_size, self.fail_close);
        self.client
            .switch_with(|| async move {
                MemoryConnection::open(server, name, page_size, fail_close)
            })
            .await
    }
}

pub struct MemoryAdapter {
    pub server: Arc<MemoryServer>,
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Driver>> {
        let rest = url.strip_prefix("memory://").ok_or_else(|| {
            DataError::invalid_connection_string(format!("expected memory:// url, got {}", url))
        })?;

        let (catalog, params) = rest.split_once('?').unwrap_or((rest, ""));
        if catalog.is_empty() {
            return Err(DataError::invalid_connection_string("missing catalog"));
        }

        let mut page_size = 10;
        let mut fail_close = false;
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("page_size", v)) => {
                    page_size = v.parse().map_err(|_| {
                        DataError::invalid_connection_string(format!("bad page_size: {}", v))
                    })?
                }
                Some(("fail_close", v)) => fail_close = v == "true",
                _ => {}
            }
        }

        let conn = MemoryConnection::open(self.server.clone(), catalog, page_size, fail_close)?;

        Ok(Arc::new(MemoryDriver {
            server: self.server.clone(),
            client: Client::new(conn),
            page_size,
            fail_close,
        }))
    }

    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String> {
        HashMap::from([("List".to_string(), opts.table.clone())])
    }
}

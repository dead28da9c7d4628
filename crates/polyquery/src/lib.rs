//! # polyquery
//!
//! Uniform query and introspection layer over heterogeneous database backends.
//!
//! Backends plug in through small traits and only implement what they support:
//!
//! - **Adapter**: parses a connection string and opens a `Driver`
//! - **Driver**: query, columns, structure, close
//! - **DatabaseSwitcher**: optional catalog switching, probed at runtime through
//!   `Driver::as_database_switcher`
//!
//! Results come back as a lazy [`ResultStream`]; paged backend APIs are walked
//! behind it through a [`PageSource`]. A [`Client`] holds the live connection of
//! a driver and can swap it atomically when switching catalogs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use polyquery::{AdapterRegistry, ConnectionRegistry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> polyquery::Result<()> {
//! // Backends register once at startup
//! let adapters = AdapterRegistry::new();
//! // adapters.register("postgres", Arc::new(polyquery_postgres::PostgresAdapter));
//!
//! let connections = ConnectionRegistry::new(Arc::new(adapters));
//! connections
//!     .register("main", "postgres://localhost/app", "postgres")
//!     .await?;
//!
//! let mut rows = connections
//!     .execute("main", CancellationToken::new(), "SELECT 1")
//!     .await?;
//! while rows.has_next().await {
//!     let row = rows.next_row().await?;
//!     println!("{:?}", row);
//! }
//!
//! connections.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod handler;
pub mod registry;
pub mod stream;
pub mod structure;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use client::{Client, Connection};
pub use error::{DataError, Result};
pub use handler::Handler;
pub use registry::{AdapterRegistry, ConnectionRegistry};
pub use stream::{PageSource, ResultStream};
pub use structure::{extract_structure, flatten_structure};
pub use traits::{Adapter, DatabaseSwitcher, Driver};
pub use types::{
    Column, DatabaseList, Row, SchemaMap, Structure, StructureType, TableOptions,
};

use crate::config::ConnectionsFile;
use anyhow::Context;
use clap::Args;
use polyquery::{AdapterRegistry, Handler};
use polyquery_databricks::DatabricksAdapter;
use polyquery_postgres::PostgresAdapter;
use polyquery_redis::RedisAdapter;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Every backend this binary ships with
pub fn adapters() -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    adapters.register("postgres", Arc::new(PostgresAdapter));
    adapters.register("redis", Arc::new(RedisAdapter));
    adapters.register("databricks", Arc::new(DatabricksAdapter));
    adapters
}

/// Which configured connection a command runs against
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Connection id from the config file
    #[arg(long, short = 'c')]
    pub connection: String,

    /// Switch to this database (catalog) before running
    #[arg(long, short = 'd')]
    pub database: Option<String>,
}

/// One registered connection, closed with [`Session::close`]
pub struct Session {
    handler: Handler,
    id: String,
}

impl Session {
    pub async fn open(config_path: &Path, target: &Target) -> anyhow::Result<Self> {
        let file = ConnectionsFile::load(config_path)?;
        let conn = file.get(&target.connection).with_context(|| {
            format!(
                "Connection '{}' is not defined in {}",
                target.connection,
                config_path.display()
            )
        })?;

        let handler = Handler::new(Arc::new(adapters()));
        handler
            .register_connection(&conn.id, &conn.url, &conn.kind)
            .await
            .with_context(|| format!("Failed to open connection '{}'", conn.id))?;

        let session = Self {
            handler,
            id: conn.id.clone(),
        };

        if let Some(database) = &target.database {
            debug!("Selecting database {} on {}", database, session.id);
            let selected = session
                .handler
                .connections()
                .select_database(&session.id, database)
                .await
                .with_context(|| format!("Failed to select database '{}'", database));

            if let Err(e) = selected {
                session.close().await;
                return Err(e);
            }
        }

        Ok(session)
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn close(self) {
        self.handler.close_all().await;
    }
}

use crate::session::{adapters, Session, Target};
use clap::Args;
use polyquery::TableOptions;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Args)]
pub struct SchemaCommand {
    #[command(flatten)]
    pub target: Target,

    /// Print the full structure tree instead of schema -> tables
    #[arg(long)]
    pub tree: bool,
}

impl SchemaCommand {
    pub fn execute(self, config_path: &Path) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let session = Session::open(config_path, &self.target).await?;

            let result = if self.tree {
                match session.handler().connections().structure(session.id()).await {
                    Ok(structure) => print_json(&structure),
                    Err(e) => Err(e.into()),
                }
            } else {
                match session.handler().get_schema(session.id()).await {
                    Ok(schema) => print_json(&schema.into_iter().collect::<BTreeMap<_, _>>()),
                    Err(e) => Err(e.into()),
                }
            };

            session.close().await;
            result
        })
    }
}

#[derive(Args)]
pub struct ColumnsCommand {
    #[command(flatten)]
    pub target: Target,

    /// Schema (or namespace) that owns the table
    #[arg(long, short = 's')]
    pub schema: String,

    /// Table name
    pub table: String,
}

impl ColumnsCommand {
    pub fn execute(self, config_path: &Path) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let session = Session::open(config_path, &self.target).await?;

            let opts = TableOptions::new(&self.schema, &self.table);
            let result = match session.handler().connections().columns(session.id(), &opts).await {
                Ok(columns) => print_json(&columns),
                Err(e) => Err(e.into()),
            };

            session.close().await;
            result
        })
    }
}

#[derive(Args)]
pub struct HelpersCommand {
    #[command(flatten)]
    pub target: Target,

    #[arg(long, short = 's')]
    pub schema: String,

    pub table: String,
}

impl HelpersCommand {
    pub fn execute(self, config_path: &Path) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let session = Session::open(config_path, &self.target).await?;

            let opts = TableOptions::new(&self.schema, &self.table);
            let result = match session.handler().connections().helpers(session.id(), &opts).await {
                Ok(helpers) => print_json(&helpers.into_iter().collect::<BTreeMap<_, _>>()),
                Err(e) => Err(e.into()),
            };

            session.close().await;
            result
        })
    }
}

#[derive(Args)]
pub struct DatabasesCommand {
    #[command(flatten)]
    pub target: Target,
}

impl DatabasesCommand {
    pub fn execute(self, config_path: &Path) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let session = Session::open(config_path, &self.target).await?;

            let result = match session
                .handler()
                .connections()
                .list_databases(session.id())
                .await
            {
                Ok(databases) => print_json(&databases),
                Err(e) => Err(e.into()),
            };

            session.close().await;
            result
        })
    }
}

#[derive(Args)]
pub struct BackendsCommand {}

impl BackendsCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        for backend in adapters().backends() {
            println!("{}", backend);
        }
        Ok(())
    }
}

use crate::session::{Session, Target};
use clap::Args;
use polyquery::{DataError, ResultStream};
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Args)]
pub struct QueryCommand {
    #[command(flatten)]
    pub target: Target,

    /// Stop after this many rows
    #[arg(long)]
    pub limit: Option<usize>,

    /// Query text, passed to the backend verbatim
    pub query: String,
}

impl QueryCommand {
    pub fn execute(self, config_path: &Path) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run(config_path))
    }

    async fn run(self, config_path: &Path) -> anyhow::Result<()> {
        let session = Session::open(config_path, &self.target).await?;

        let ctx = CancellationToken::new();
        let interrupt = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling query");
                interrupt.cancel();
            }
        });

        let result = async {
            let rows = session
                .handler()
                .execute(session.id(), ctx.clone(), &self.query)
                .await?;
            write_rows(rows, self.limit, &mut std::io::stdout()).await
        }
        .await;

        session.close().await;
        result
    }
}

/// Column names as one JSON array line, then one JSON array line per row
async fn write_rows(
    mut rows: ResultStream,
    limit: Option<usize>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let names: Vec<&str> = rows.columns().iter().map(|c| c.name.as_str()).collect();
    serde_json::to_writer(&mut *out, &names)?;
    writeln!(out)?;

    let mut count = 0;
    loop {
        // Checked before has_next so no row past the limit is fetched
        if limit.is_some_and(|limit| count >= limit) {
            debug!("Row limit reached, closing result stream");
            rows.close();
            break;
        }

        if !rows.has_next().await {
            break;
        }

        let row = match rows.next_row().await {
            Ok(row) => row,
            Err(DataError::Cancelled) => anyhow::bail!("Query cancelled after {} rows", count),
            Err(e) => return Err(e.into()),
        };

        serde_json::to_writer(&mut *out, &row)?;
        writeln!(out)?;
        count += 1;
    }

    out.flush()?;
    debug!("Fetched {} rows", count);
    Ok(())
}

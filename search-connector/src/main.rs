use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use search_connector::{AppError, ConnectorConfig, Dependencies};
use search_connector_pipeline::{ConnectorError, PartitionStrategy};
use search_connector_shared::Record;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "search-connector")]
#[command(about = "Bounded reads from and bulk writes to a search index", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine address, overrides OPENSEARCH_URL
    #[arg(long, global = true)]
    address: Option<String>,

    /// Index name, overrides SEARCH_INDEX
    #[arg(long, global = true)]
    index: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every document matching a query as NDJSON
    Read {
        /// Query DSL, overrides SEARCH_QUERY
        #[arg(long)]
        query: Option<String>,

        /// Desired number of partitions read concurrently
        #[arg(long)]
        parallelism: Option<usize>,

        /// Partition strategy: shard_routing or sliced
        #[arg(long)]
        strategy: Option<PartitionStrategy>,

        /// Documents per scroll page
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Bulk-index NDJSON records read from stdin
    Write {
        /// Document type of written records
        #[arg(long)]
        doc_type: Option<String>,

        /// Max actions per bulk request
        #[arg(long)]
        batch_size: Option<usize>,

        /// Max bulk requests in flight
        #[arg(long)]
        concurrent_requests: Option<usize>,

        /// Partial batch flush interval in milliseconds, 0 disables
        #[arg(long)]
        flush_interval_ms: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<ConnectorConfig, AppError> {
    let mut config = ConnectorConfig::from_env()?;

    if let Some(address) = &cli.address {
        config.address = address.clone();
    }
    if let Some(index) = &cli.index {
        config.index = index.clone();
    }

    match &cli.command {
        Commands::Read {
            query,
            parallelism,
            strategy,
            page_size,
        } => {
            if let Some(query) = query {
                config.query = query.clone();
            }
            config.parallelism = parallelism.unwrap_or(config.parallelism);
            config.partition_strategy = strategy.unwrap_or(config.partition_strategy);
            config.page_size = page_size.unwrap_or(config.page_size);
        }
        Commands::Write {
            doc_type,
            batch_size,
            concurrent_requests,
            flush_interval_ms,
        } => {
            if let Some(doc_type) = doc_type {
                config.doc_type = doc_type.clone();
            }
            config.batch_size = batch_size.unwrap_or(config.batch_size);
            config.concurrent_requests = concurrent_requests.unwrap_or(config.concurrent_requests);
            if let Some(ms) = flush_interval_ms {
                config.flush_interval = Duration::from_millis(*ms);
            }
        }
    }

    config.validate()?;
    Ok(config)
}

async fn run_read(deps: &Dependencies) -> Result<()> {
    let config = &deps.config;
    let mut documents = deps
        .reader()
        .read(&config.query(), &config.index, config.parallelism)
        .await?;

    let mut stdout = BufWriter::new(tokio::io::stdout());
    let mut count = 0usize;
    while let Some(document) = documents.next().await {
        let document = document?;
        stdout.write_all(document.source.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        count += 1;
    }
    stdout.flush().await?;

    info!(documents = count, index = %config.index, "Read completed");
    Ok(())
}

async fn run_write(deps: &Dependencies) -> Result<()> {
    let writer = deps.writer();
    let target = deps.config.target();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, draining pending bulk requests");
                interrupted = true;
                None
            }
        };
        let Some(line) = line else { break };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        writer.write(Record::from(line), target.clone()).await?;
    }

    match writer.close().await {
        Ok(summary) => {
            info!(
                acknowledged = summary.acknowledged,
                batches = summary.batches,
                interrupted,
                "Write completed"
            );
            Ok(())
        }
        Err(ConnectorError::PartialBulkFailure {
            failed,
            acknowledged,
            failures,
        }) => {
            for failure in &failures {
                warn!(
                    batch_id = failure.batch_id,
                    position = failure.position,
                    status = ?failure.status,
                    reason = %failure.reason,
                    "Record rejected"
                );
            }
            anyhow::bail!("{} records failed, {} acknowledged", failed, acknowledged)
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let rendered = serde_json::to_string(&config)?;
    debug!(config = %rendered, "Loaded configuration");

    let deps = Dependencies::new(config).await?;

    let result = match cli.command {
        Commands::Read { .. } => run_read(&deps).await,
        Commands::Write { .. } => run_write(&deps).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Connector failed");
    }
    result
}

use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use strata_store::kv::FjallDbFactory;
use strata_store::rpc::{DisconnectedClient, Node};
use strata_store::wal::{FileWalFactory, SyncMode};

#[derive(Parser, Debug)]
#[command(name = "strata-node", about = "Strata shard store node")]
struct NodeArgs {
    /// Directory holding the KV keyspace and per-shard WALs.
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Directory holding the per-shard WALs. Defaults to `<data-dir>/wal`.
    #[arg(long)]
    wal_dir: Option<String>,

    /// Number of shards hosted by this node (ids 0..shards).
    #[arg(long, default_value_t = 1)]
    shards: u64,

    /// WAL durability mode: none, data, or all.
    #[arg(long, default_value = "data")]
    wal_sync: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = NodeArgs::parse();
    let sync_mode = SyncMode::parse(&args.wal_sync)
        .ok_or_else(|| anyhow::anyhow!("invalid --wal-sync value: {}", args.wal_sync))?;

    let data_dir = PathBuf::from(&args.data_dir);
    fs::create_dir_all(&data_dir).context("create data dir")?;
    let storage_dir = data_dir.join("storage");
    let wal_dir = args
        .wal_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("wal"));

    let db_factory = FjallDbFactory::open(&storage_dir)?;
    let wal_factory = FileWalFactory::new(&wal_dir, sync_mode);

    let shards: Vec<u64> = (0..args.shards.max(1)).collect();
    let node = Node::new(
        &shards,
        Arc::new(DisconnectedClient),
        &wal_factory,
        &db_factory,
    )
    .map_err(|err| anyhow::anyhow!(err))?;

    tracing::info!(
        shards = shards.len(),
        data_dir = %data_dir.display(),
        "strata node ready, waiting for coordinator"
    );
    tracing::info!(status = %node.status_json().await?, "shard status");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    node.close().await.map_err(|err| anyhow::anyhow!(err))?;
    Ok(())
}

use actor_index::{
    ActorKey, FileStateStore, IndexingConfig, QueueAddress, QueueId, StateStore,
    WorkflowQueueEntry,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "queue-tool")]
#[command(about = "Inspection tooling for actor-index workflow queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a queue key ("IPlayer-3") or a queue storage key.
    ParseKey { key: String },
    /// Partition an actor maps to for an interface.
    Partition {
        #[arg(long)]
        interface: String,
        #[arg(long)]
        actor: String,
        #[arg(long, default_value_t = 4)]
        partitions: u32,
    },
    /// Print the durable state of a queue kept by a file state store.
    Inspect {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        verbose: bool,
    },
    /// Validate an indexing configuration file.
    CheckConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::ParseKey { key } => parse_key(&key),
        Command::Partition {
            interface,
            actor,
            partitions,
        } => {
            let queue = QueueId::for_actor(&interface, &ActorKey::new(actor), partitions);
            println!("{}", queue);
            Ok(())
        }
        Command::Inspect { root, key, verbose } => inspect(root, &key, verbose).await,
        Command::CheckConfig { path } => {
            let config = IndexingConfig::load(&path)
                .await
                .with_context(|| format!("Invalid config '{}'", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn parse_key(key: &str) -> Result<()> {
    if key.contains('/') {
        let address = QueueAddress::from_storage_key(key)?;
        println!(
            "silo={} interface={} partition={}",
            address.silo,
            address.queue.interface(),
            address.queue.sequence()
        );
    } else {
        let queue = QueueId::parse(key)?;
        println!(
            "interface={} partition={}",
            queue.interface(),
            queue.sequence()
        );
    }
    Ok(())
}

async fn inspect(root: PathBuf, key: &str, verbose: bool) -> Result<()> {
    let address = QueueAddress::from_storage_key(key)?;
    let store = FileStateStore::new(root);
    let stored = store
        .read(key)
        .await?
        .ok_or_else(|| anyhow!("No state stored under '{}'", key))?;
    let entry: WorkflowQueueEntry = serde_json::from_value(stored.value)
        .with_context(|| format!("State under '{}' is not a workflow queue", key))?;

    println!(
        "{} etag={} records={} punctuations={}",
        address,
        stored.etag,
        entry.record_count(),
        entry.punctuation_count()
    );

    let mut segment = 0usize;
    for node in entry.nodes() {
        match node.workflow() {
            Some(record) => {
                println!(
                    "  [{}] {} actor={} interface={} at={}",
                    segment,
                    record.workflow_id(),
                    record.actor(),
                    record.interface(),
                    record.created_at().to_rfc3339()
                );
                if verbose {
                    for (index, update) in record.updates() {
                        println!("      {} {}", index, update);
                    }
                }
            }
            None => segment += 1,
        }
    }
    Ok(())
}

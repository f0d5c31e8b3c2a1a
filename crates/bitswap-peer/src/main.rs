use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bitswap_peer::{
    default_data_dir, Connection, Connector, JsonWantlistCodec, OutboundMessage, PeerId,
    ProtocolVersion, ResolvedItem, Responder, ResponderConfig, ResponderMetrics, SledBlockStore,
    WantlistCodec,
};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the block store directory
    #[arg(short, long, default_value_os_t = default_data_dir())]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store data in the blockstore and print its CID
    Put {
        /// Data to store (as a string)
        data: String,
    },
    /// Retrieve data from the blockstore by CID
    Get {
        /// CID of the data to retrieve
        cid: String,
    },
    /// Answer a JSON wantlist from the blockstore and print the responses
    Respond {
        /// Path to the wantlist file
        wantlist: PathBuf,
        /// Negotiated protocol
        #[arg(short, long, default_value = "/ipfs/bitswap/1.2.0")]
        protocol: ProtocolVersion,
        /// Overrides BLOCKS_BATCH_SIZE
        #[arg(long)]
        batch_size: Option<usize>,
        /// Overrides MAX_MESSAGE_SIZE
        #[arg(long)]
        max_message_size: Option<usize>,
        /// Print the collected metrics when done
        #[arg(long)]
        metrics: bool,
    },
}

/// Prints every message instead of writing it to a peer.
struct StdoutConnection {
    peer: PeerId,
}

#[async_trait]
impl Connection for StdoutConnection {
    async fn send(&self, message: &OutboundMessage) -> bitswap_peer::Result<()> {
        println!(
            "message to {} ({}, {} items, {} bytes)",
            self.peer,
            message.protocol(),
            message.len(),
            message.size()
        );
        for item in message.items() {
            match item {
                ResolvedItem::Block(block) => {
                    println!("  block    {} {} bytes", block.cid, block.size())
                }
                ResolvedItem::Presence(presence) => {
                    println!("  presence {} {:?}", presence.cid, presence.kind)
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> bitswap_peer::Result<()> {
        Ok(())
    }
}

struct StdoutConnector;

#[async_trait]
impl Connector for StdoutConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        _protocol: ProtocolVersion,
    ) -> bitswap_peer::Result<Arc<dyn Connection>> {
        Ok(Arc::new(StdoutConnection { peer: *peer }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store = SledBlockStore::new(&cli.data_dir)
        .with_context(|| format!("cannot open block store at {}", cli.data_dir.display()))?;

    match cli.command {
        Commands::Put { data } => {
            let cid = store.put(data.as_bytes())?;
            println!("Stored data with CID: {}", cid);
        }
        Commands::Get { cid } => {
            let cid = cid.parse()?;
            if let Some(data) = store.get(&cid)? {
                if let Ok(s) = String::from_utf8(data.to_vec()) {
                    println!("{}", s);
                } else {
                    println!("<binary data>");
                }
            } else {
                eprintln!("No data found for CID: {}", cid);
                std::process::exit(1);
            }
        }
        Commands::Respond {
            wantlist,
            protocol,
            batch_size,
            max_message_size,
            metrics,
        } => {
            let mut config = ResponderConfig::from_env()?;
            if let Some(batch_size) = batch_size {
                config = config.batch_size(batch_size);
            }
            if let Some(max_message_size) = max_message_size {
                config = config.max_message_size(max_message_size);
            }
            config.validate()?;

            let payload = std::fs::read(&wantlist)
                .with_context(|| format!("cannot read {}", wantlist.display()))?;
            let wantlist = JsonWantlistCodec.decode(&payload, protocol)?;

            let registry = Registry::new();
            let responder = Responder::with_store(
                config,
                Arc::new(store),
                Arc::new(StdoutConnector),
                Arc::new(JsonWantlistCodec),
                ResponderMetrics::new(&registry)?,
            );

            let summary = responder
                .respond(PeerId::random(), protocol, wantlist, None)
                .await;
            println!(
                "{} batches, {}/{} entries answered, session {:?}",
                summary.batches, summary.entries_sent, summary.entries_planned, summary.state
            );

            if metrics {
                let mut buffer = Vec::new();
                TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
                print!("{}", String::from_utf8_lossy(&buffer));
            }
        }
    }

    Ok(())
}

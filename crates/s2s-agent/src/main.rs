//! s2s-agent -- queue files locally and drain them to a NiFi input port.
//!
//! Usage:
//!   s2s-agent send a.csv b.csv          # Enqueue files
//!   s2s-agent process                   # Drain the queue once
//!   s2s-agent run                       # Drain periodically until Ctrl-C
//!   s2s-agent --config path.toml status

use s2s_agent::config::AgentConfig;
use s2s_agent::{build_client, drain_task, expand_tilde, open_queue, open_store, packet_from_file};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "s2s-agent", about = "NiFi Site-to-Site agent")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.s2s/agent.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue files as packets
    Send {
        /// Files to enqueue
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Drain the queue once
    Process,
    /// Apply TTL, row and size limits to the queue
    Cleanup,
    /// Show queue statistics
    Status,
    /// Fetch and print the peer list
    Peers,
    /// Drain and clean up periodically (default)
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s2s_agent=info,s2s_client=info,s2s_queue=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = AgentConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Send { files }) => {
            let store = open_store(&cfg)?;
            let packets = files
                .iter()
                .map(|f| packet_from_file(f))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let stored = store.enqueue(&packets)?;
            println!("Enqueued {stored} packet(s)");
        }
        Some(Commands::Process) => {
            let queue = open_queue(&cfg)?;
            let stats = queue.process().await?;
            println!(
                "Sent {} packet(s) in {} batch(es)",
                stats.packets, stats.batches
            );
            if stats.destination_full > 0 {
                eprintln!("Warning: destination full on {} batch(es)", stats.destination_full);
            }
        }
        Some(Commands::Cleanup) => {
            let stats = open_store(&cfg)?.cleanup()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Some(Commands::Status) => {
            let stats = open_store(&cfg)?.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Some(Commands::Peers) => {
            let client = build_client(&cfg)?;
            for peer in client.get_peers().await? {
                let addr = peer.address();
                println!(
                    "{}\thttp={}\traw={}\tsecure={}\tflowfiles={}",
                    addr.host,
                    addr.http_port.map_or("-".to_string(), |p| p.to_string()),
                    addr.raw_port.map_or("-".to_string(), |p| p.to_string()),
                    addr.secure,
                    peer.flow_file_count,
                );
            }
        }
        Some(Commands::Run) | None => {
            run_agent(cfg).await?;
        }
    }

    Ok(())
}

async fn run_agent(cfg: AgentConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = %cfg.client.transport,
        seeds = cfg.client.urls.len(),
        db = %expand_tilde(&cfg.queue.database).display(),
        "starting s2s-agent"
    );

    let queue = Arc::new(open_queue(&cfg)?);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let drain_handle = {
        let queue = queue.clone();
        let shutdown = shutdown_tx.subscribe();
        let process_interval = Duration::from_secs(cfg.agent.process_interval_secs.max(1));
        let cleanup_interval = Duration::from_secs(cfg.agent.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            drain_task::run_drain_loop(queue, process_interval, cleanup_interval, shutdown).await;
        })
    };

    tracing::info!("drain loop spawned, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(());
    let _ = drain_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}

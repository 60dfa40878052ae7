use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use edge_gateway::agent::Agent;
use edge_gateway::buffer::DurableBuffer;
use edge_gateway::config::AgentConfig;
use edge_gateway::drivers::SyncOutcome;
use edge_gateway::registry::MachineRegistry;
use edge_gateway::{logging, metrics, runtime};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Industrial edge gateway: machine discovery, driver sync, polling and store-and-forward uplink")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file (defaults to $EDGE_GATEWAY_CONFIG or edge-gateway.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full agent until Ctrl-C
    Run,
    /// Run one discovery cycle and print what was found
    Discover,
    /// Sync the drivers the machine registry needs from the hub
    SyncDrivers,
    /// Print durable buffer counts
    BufferStats,
    /// Mark a machine as enrolled so it gets polled
    Enroll {
        /// Machine id as listed in the registry
        machine_id: String,
    },
    /// Isolated driver call: reads one job on stdin, writes one reply on stdout
    #[command(hide = true)]
    DriverWorker,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // stdout is the reply channel here, so nothing else may write to it
    if let Commands::DriverWorker = cli.command {
        logging::init_stderr_logging();
        runtime::worker::serve_stdio().await?;
        return Ok(());
    }

    let config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let _log_guard = logging::init_logging(&config.paths.log_dir);

    match cli.command {
        Commands::Run => {
            metrics::init_metrics();
            info!(device_id = %config.gateway.device_id, "Starting edge gateway");
            let agent = Arc::new(Agent::open(config)?);
            agent.run().await?;
        }
        Commands::Discover => {
            let agent = Agent::open(config)?;
            let report = agent.discover_once().await?;
            println!("🔎 Discovery: {} candidates, {} fingerprints", report.candidates, report.matches.len());
            for (fp, selection) in &report.matches {
                let identity = [fp.vendor.as_deref(), fp.model.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                match selection {
                    Some(m) => println!(
                        "   {} {} [{}] -> {} {} (score {:.2})",
                        fp.ip, fp.protocol, identity, m.manifest.name, m.manifest.version, m.score
                    ),
                    None => println!("   {} {} [{}] -> no driver", fp.ip, fp.protocol, identity),
                }
            }
            print_sync(&report.sync);
            if !report.enrolled.is_empty() {
                println!("✅ Enrolled: {}", report.enrolled.join(", "));
            }
            agent.buffer().close()?;
        }
        Commands::SyncDrivers => {
            let agent = Agent::open(config)?;
            let outcomes = agent.sync_drivers().await?;
            if outcomes.is_empty() {
                println!("No hub drivers required by the registry");
            }
            print_sync(&outcomes);
            agent.buffer().close()?;
        }
        Commands::BufferStats => {
            let buffer = DurableBuffer::open(config.buffer_path())?;
            let stats = buffer.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            buffer.close()?;
        }
        Commands::Enroll { machine_id } => {
            let mut registry = MachineRegistry::load(config.registry_path());
            if !registry.enroll(&machine_id) {
                bail!("machine '{}' is not in the registry", machine_id);
            }
            registry.save()?;
            println!("✅ {} enrolled", machine_id);
        }
        Commands::DriverWorker => {}
    }
    Ok(())
}

fn print_sync(outcomes: &[(String, SyncOutcome)]) {
    for (driver_id, outcome) in outcomes {
        match outcome {
            SyncOutcome::AlreadyActive { version } => println!("   {} {} already active", driver_id, version),
            SyncOutcome::Activated { version } => println!("📦 {} {} activated", driver_id, version),
            SyncOutcome::Rejected { reason } => println!("⛔ {} rejected: {}", driver_id, reason),
            SyncOutcome::Unavailable { error } => println!("⚠️  {} unavailable: {}", driver_id, error),
            SyncOutcome::Failed { error } => println!("❌ {} failed: {}", driver_id, error),
        }
    }
}

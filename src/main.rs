use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use roadwatch::config::{LogFormat, LoggingConfig, RoadwatchConfig};
use roadwatch::detect::Detector;
use roadwatch::recorder::{RingIndexStore, SlotTable};

#[derive(Parser)]
#[command(
    name = "roadwatch",
    about = "Pothole detection with a ring-buffered dashcam",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (otherwise $ROADWATCH_CONFIG, then /etc/roadwatch/roadwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (sensor + recorder + API server)
    Serve {
        /// Override the API bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the detector over a recorded `timestamp_ms,x,y,z` trace
    Replay {
        /// CSV trace file
        file: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted ring index and the slot files on disk
    RingStatus,

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = RoadwatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting Roadwatch daemon");
            roadwatch::serve(config).await?;
        }
        Commands::Replay { file, json } => {
            let samples = roadwatch::sensor::load_replay(&file)?;
            let (mut detector, _) = Detector::from_config(&config.detector, &config.gate)?;
            let triggers: Vec<_> = samples
                .iter()
                .filter_map(|s| detector.ingest(s))
                .collect();

            if json {
                let report = serde_json::json!({
                    "samples": samples.len(),
                    "triggers": triggers,
                    "metrics": detector.metrics(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Replayed {} samples from {}", samples.len(), file.display());
                for t in &triggers {
                    println!("  pothole at {} ms", t.timestamp_ms);
                }
                println!("{} trigger(s)", triggers.len());
            }
        }
        Commands::RingStatus => {
            let pool = roadwatch::storage::open_pool(&config.storage.db_path)?;
            let store = roadwatch::storage::SqliteIndexStore::new(pool);
            let index = store.load(&config.ring.name)?;
            let slots = SlotTable::scan(
                &config.ring.segment_dir,
                &config.ring.extension,
                config.ring.slots,
            )?;

            match index {
                Some(i) => println!("Ring '{}': next slot {}", config.ring.name, i),
                None => println!("Ring '{}': no persisted index", config.ring.name),
            }
            println!("{:<6} | {:<9} | {:<25} | Path", "Slot", "Finalized", "Modified");
            println!("{:-<6}-|-{:-<9}-|-{:-<25}-|-{:-<30}", "", "", "", "");
            for slot in slots.all() {
                let modified = slot
                    .last_modified
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<6} | {:<9} | {:<25} | {}",
                    slot.index,
                    if slot.finalized { "yes" } else { "no" },
                    modified,
                    slot.path.display()
                );
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

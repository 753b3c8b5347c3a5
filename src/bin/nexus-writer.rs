use clap::Parser;
use log::{error, info};
use nexus_writer::nexus_writer::config::AppConfig;
use nexus_writer::nexus_writer::modules::writer_modules;
use nexus_writer::nexus_writer::schema::payload_readers;
use nexus_writer::nexus_writer::server::Master;
use std::path::PathBuf;
use std::process::ExitCode;

/// Writes hierarchical data files from Kafka instrument streams, driven by
/// JSON templates received as commands.
#[derive(Parser)]
#[command(name = "nexus-writer")]
#[command(about = "Streaming ingest engine: Kafka instrument data to hierarchical files")]
#[command(version)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Kafka broker addresses
    #[arg(long)]
    brokers: Option<String>,

    /// Topic to poll for commands
    #[arg(long)]
    command_topic: Option<String>,

    /// Topic to publish aggregate status to
    #[arg(long)]
    status_topic: Option<String>,

    /// Identity reported in status documents
    #[arg(long)]
    service_id: Option<String>,

    /// Directory output files are written into
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Status publish cadence in milliseconds
    #[arg(long)]
    status_interval_ms: Option<u64>,

    /// Print registered payload readers and writer modules, then exit
    #[arg(long)]
    list_modules: bool,
}

fn list_modules() {
    println!("Registered payload readers:");
    for tag in payload_readers().tags() {
        println!("  {}", tag);
    }
    println!("Registered writer modules:");
    for id in writer_modules().ids() {
        println!("  {}", id);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.list_modules {
        list_modules();
        return ExitCode::SUCCESS;
    }

    let mut config = match &cli.config {
        Some(path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => AppConfig::default(),
    };
    if let Some(brokers) = cli.brokers {
        config.brokers = brokers;
    }
    if let Some(command_topic) = cli.command_topic {
        config.command_topic = command_topic;
    }
    if let Some(status_topic) = cli.status_topic {
        config.status_topic = Some(status_topic);
    }
    if let Some(service_id) = cli.service_id {
        config.service_id = Some(service_id);
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(interval) = cli.status_interval_ms {
        config.status_interval_ms = interval;
    }
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let master = Master::new(config);
    match master.run().await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Master failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

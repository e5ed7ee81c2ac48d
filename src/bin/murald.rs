use std::path::PathBuf;

use clap::{ArgAction, Parser};

use mural::server::Replica;
use mural::{telemetry, Config};

#[derive(Parser, Debug)]
#[command(
    name = "murald",
    version,
    about = "Replicated bulletin-board message server"
)]
struct Args {
    /// Unique replica name (overrides SERVER_NAME).
    #[arg(long)]
    name: Option<String>,

    /// Data directory (overrides DATA_DIR).
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Registry address host:port (overrides REGISTRY_ADDR).
    #[arg(long)]
    registry: Option<String>,

    #[arg(long)]
    client_port: Option<u16>,

    #[arg(long)]
    replication_port: Option<u16>,

    #[arg(long)]
    election_port: Option<u16>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    telemetry::init(args.verbose);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = Replica::new(config).run() {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<Config, mural::config::ConfigError> {
    let mut config = Config::from_env()?;
    if let Some(name) = &args.name {
        config.advertise_host = name.clone();
        config.server_name = name.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(registry) = &args.registry {
        config.registry_addr = registry.clone();
    }
    if let Some(port) = args.client_port {
        config.client_port = port;
    }
    if let Some(port) = args.replication_port {
        config.replication_port = port;
    }
    if let Some(port) = args.election_port {
        config.election_port = port;
    }
    Ok(config)
}

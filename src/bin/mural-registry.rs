use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use mural::registry::{Registry, RegistryConfig};
use mural::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "mural-registry",
    version,
    about = "Reference server: rank assignment, peer list and heartbeats"
)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:5559")]
    bind: String,

    /// Data directory for reference.json.
    #[arg(long, value_name = "PATH", default_value = "/data")]
    data_dir: PathBuf,

    /// Drop servers silent for this many seconds.
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout_secs: u64,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    telemetry::init(args.verbose);

    let config = RegistryConfig {
        bind_addr: args.bind,
        data_dir: args.data_dir,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        ..RegistryConfig::default()
    };

    let registry = match Registry::new(config) {
        Ok(registry) => registry,
        Err(err) => {
            tracing::error!("registry init failed: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = registry.run() {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}

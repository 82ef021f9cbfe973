use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use pico_args::Arguments;
use tracing::{error, info};

use dhcp6ce::codec::DhcprotoCodec;
use dhcp6ce::config::EngineConfig;
use dhcp6ce::reactor::{EngineEvent, Reactor};
use dhcp6ce::transport::UdpTransport;

const HELP: &str = "\
dhcp6-client-engine

USAGE:
  dhcp6-client-engine [--config-dir <dir>]

OPTIONS:
  --config-dir <dir>   Directory containing engine.json [default: /etc/dhcp6-client-engine]
  -h, --help           Print this message
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print!("{HELP}");
        return Ok(());
    }
    let config_dir: PathBuf = args
        .opt_value_from_str("--config-dir")?
        .unwrap_or_else(|| PathBuf::from("/etc/dhcp6-client-engine"));

    let config = match EngineConfig::load_from_files(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load engine.json from {}: {e}", config_dir.display());
            EngineConfig::default()
        }
    };

    dhcp6ce::logging::init_stdout(config.log_level);
    info!(config_dir = %config_dir.display(), "starting dhcp6-client-engine");

    let config = Arc::new(ArcSwap::from_pointee(config));
    let _sighup = dhcp6ce::signal::spawn_sighup_handler(Arc::clone(&config), config_dir);

    let transport = UdpTransport::bind()?;
    let mut reactor = Reactor::new(transport, DhcprotoCodec, Arc::clone(&config))?;

    info!("entering event loop");
    loop {
        let events = reactor.tick(Duration::from_secs(30));
        for event in events {
            match event {
                EngineEvent::LeaseReady { ifindex, lease } => {
                    info!(ifindex, server = %lease.server_duid, "lease acquired");
                }
                EngineEvent::LeaseFailed { ifindex, error } => {
                    error!(ifindex, %error, "lease acquisition failed");
                }
            }
        }
    }
}

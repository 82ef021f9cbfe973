use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::config::EngineConfig;

/// Spawn a thread that handles SIGHUP by reloading `engine.json` from disk.
pub fn spawn_sighup_handler(
    config: Arc<ArcSwap<EngineConfig>>,
    config_dir: PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            let mut signals = Signals::new([SIGHUP]).expect("Failed to register SIGHUP handler");

            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!("received SIGHUP, reloading engine config");
                    match EngineConfig::load_from_files(&config_dir) {
                        Ok(new_config) => {
                            config.store(Arc::new(new_config));
                            info!("reloaded engine config");
                        }
                        Err(e) => error!(%e, "failed to reload engine config"),
                    }
                }
            }
        })
        .expect("Failed to spawn SIGHUP handler thread")
}

//! Application runner - wires settings, registry, mailbox and engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::cli::Args;
use crate::core::engine::Engine;
use crate::core::mailbox::{FileStore, MailboxAdapter};
use crate::driver::{DriverHandle, MatrixDriver, NullDriver, PngDumpDriver};
use crate::paths;
use crate::plugins::builtin::{BannerPlugin, ClockPlugin};
use crate::plugins::PluginRegistry;
use crate::settings::Settings;

/// Run the marquee engine with given arguments.
///
/// Blocks until a stop-with-shutdown command arrives through the mailbox or
/// the hardware driver fails.
pub fn run_app(args: Args) -> Result<()> {
    let path_config = paths::PathConfig::from_env_and_cli(args.config_dir.clone());

    if let Err(e) = paths::ensure_dirs(&path_config) {
        warn!("Failed to create application directories: {:#}", e);
    }

    let settings_path = paths::config_file("marquee.json", &path_config);
    info!("Config path: {}", settings_path.display());
    let mut settings = Settings::load_or_init(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;

    // CLI overrides on top of the settings file
    if let Some(vegas) = args.vegas {
        settings.vegas.enabled = vegas != 0;
    }
    if let Some(fps) = args.fps {
        settings.tick.rotation_fps = fps;
        settings.tick.vegas_fps = fps;
    }
    if let Some(workers) = args.workers {
        settings.workers.threads = workers.max(1);
    }

    // Built-in demo sources; real deployments register external plugins here
    let mut registry = PluginRegistry::new(settings.health.failure_threshold);
    registry.register(Arc::new(ClockPlugin::new()));
    registry.register(Arc::new(BannerPlugin::new(settings.matrix.height)));
    let registry = Arc::new(registry);

    let mailbox_dir = settings
        .mailbox
        .dir
        .clone()
        .unwrap_or_else(|| paths::data_file("mailbox", &path_config));
    info!("Mailbox store: {}", mailbox_dir.display());
    let store = FileStore::new(
        mailbox_dir,
        Duration::from_secs(settings.mailbox.request_ttl_secs),
        Duration::from_secs(settings.mailbox.processed_ttl_secs),
    )?;
    let adapter = MailboxAdapter::new(
        Box::new(store),
        Duration::from_millis(settings.mailbox.poll_interval_ms),
    );

    let driver: Box<dyn MatrixDriver> = match &args.dump_frames {
        Some(dir) => {
            info!("Frame dumps to {} (every {} frames)", dir.display(), args.dump_every);
            Box::new(PngDumpDriver::new(dir.clone(), args.dump_every)?)
        }
        None => Box::new(NullDriver::new()),
    };
    let driver = DriverHandle::spawn(driver);

    let mut engine = Engine::new(settings, registry, adapter, driver);

    // Stale dumps from a previous run are cleaned up whenever the display
    // first goes idle; not worth delaying the first frame for
    if let Some(dir) = args.dump_frames.clone() {
        let started = std::time::SystemTime::now();
        engine.deferred_mut().enqueue(10, "prune-stale-dumps", move || {
            let mut removed = 0usize;
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let is_old_dump = entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("frame_")
                    && entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .map(|t| t < started)
                        .unwrap_or(false);
                if is_old_dump {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            if removed > 0 {
                info!("Pruned {} stale frame dump(s)", removed);
            }
            Ok(())
        });
    }

    engine.run()?;

    info!("Engine stopped");
    Ok(())
}

//! Subscriber installation for the configured sinks.

use std::{fs, sync::Arc};

use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

/// Install the global subscriber per the `[logging]` section. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log = &settings.logging;

    if log.save_log {
        let _ = fs::create_dir_all(&log.logs_dir);
        let path = std::path::Path::new(&log.logs_dir).join(&log.app_log_filename);
        match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .try_init();
                return;
            }
            Err(e) => {
                eprintln!("could not open log file {}: {e}", path.display());
            }
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

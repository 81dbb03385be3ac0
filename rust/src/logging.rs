use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, Once};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "cognito.log";
const DEFAULT_FILTER: &str = "cognito_core=info";

static INIT: Once = Once::new();

/// Stderr plus `cognito.log` in the data dir. Later calls are no-ops, and a global subscriber
/// installed by the host wins.
pub fn init_logging(data_dir: &str) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let path = Path::new(data_dir).join(LOG_FILE_NAME);
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("cognito: cannot open {}: {e}", path.display());
                None
            }
        };
        let file_layer = file.map(|f| {
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(f))
        });

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(file_layer)
            .try_init();
    });
}

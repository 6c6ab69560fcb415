//! Process settings read from the environment, and logging setup.

use std::{env, path::{self, PathBuf}};

use tracing_subscriber::EnvFilter;


pub const TEMP_DIR_ENV: &str = "CAXA_TEMP_DIR";
pub const LOG_ENV: &str = "CAXA_LOG";

/// Process configuration, resolved once in `main` and threaded through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base cache directory holding `apps/` and `locks/`.
    pub temp_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        let temp_dir = env::var_os(TEMP_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("caxa"));
        // staging paths are substituted into commands, keep them absolute
        let temp_dir = path::absolute(&temp_dir).unwrap_or(temp_dir);
        Settings { temp_dir }
    }

    pub fn with_temp_dir(temp_dir: impl Into<PathBuf>) -> Self {
        Settings { temp_dir: temp_dir.into() }
    }
}

/// Stderr logging filtered by `CAXA_LOG`, quiet by default so the wrapped
/// application's own stderr is left alone.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

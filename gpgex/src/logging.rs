//! Logging setup.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};

/// Variable controlling the log filter.
pub const ENV_LOG: &str = "GPGEX_LOG";

/// Initializes the logger.
///
/// Logs go to stderr, filtered according to `GPGEX_LOG`, by default
/// only warnings and errors.  If `debug_file` is given, logs are
/// appended to that file instead, and debug messages are included
/// unless `GPGEX_LOG` says otherwise.
pub fn init(debug_file: Option<&Path>) -> Result<()> {
    let default = if debug_file.is_some() { "debug" } else { "warn" };
    let mut builder = Builder::from_env(Env::new().filter_or(ENV_LOG, default));

    if let Some(path) = debug_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Opening debug file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.try_init()
        .context("Initializing the logger")?;
    Ok(())
}

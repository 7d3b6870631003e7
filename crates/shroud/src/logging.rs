//! Configure the tracing subscriber for the shroud binary.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::cfg::LoggingConfig;

/// Install the global tracing subscriber.
///
/// The filter comes from the command line when given there, and from the
/// configuration otherwise.
pub(crate) fn setup(config: &LoggingConfig, cli_filter: Option<&str>) -> Result<()> {
    let directives = cli_filter.unwrap_or(&config.console);
    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("Bad log filter {directives:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

//! Configuration for the shroud binary.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shroud_engine::{ListenerMode, ListenerParams};
use shroud_obfs::ProtocolSpec;

/// The whole configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ShroudConfig {
    /// Logging options.
    #[serde(default)]
    pub(crate) logging: LoggingConfig,

    /// The listeners to run, one `[[listener]]` block each.
    #[serde(default, rename = "listener")]
    pub(crate) listeners: Vec<ListenerConfig>,
}

/// Options for console logging.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoggingConfig {
    /// Filtering directives that determine tracing levels, as described at
    /// <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html>
    ///
    /// You can override this setting with the -l command line parameter.
    ///
    /// Example: "info,shroud_engine=trace"
    #[serde(default = "default_console_filter")]
    pub(crate) console: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            console: default_console_filter(),
        }
    }
}

/// Return the default tracing filter for `logging.console`.
fn default_console_filter() -> String {
    "info".to_owned()
}

/// One listener from the configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ListenerConfig {
    /// Which of the three listener behaviors to run.
    mode: Mode,

    /// The local address to bind.
    listen: SocketAddr,

    /// The fixed downstream target. Required for the simple modes, and
    /// forbidden for socks-client, which picks targets per request.
    #[serde(default)]
    target: Option<SocketAddr>,

    /// The obfuscation protocol to apply on the wire.
    #[serde(default = "default_protocol")]
    protocol: String,

    /// Give up on connections after this much inactivity.
    ///
    /// In humantime format, e.g. "90s" or "10m". Unset means never.
    #[serde(default, with = "humantime_serde::option")]
    idle_timeout: Option<Duration>,
}

/// Return the default value for `listener.protocol`.
fn default_protocol() -> String {
    "dummy".to_owned()
}

/// A listener mode, as spelled in the configuration file.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Mode {
    /// Accept cleartext, tunnel it obfuscated to a fixed target.
    SimpleClient,
    /// Accept obfuscated traffic, forward cleartext to a fixed target.
    SimpleServer,
    /// Accept SOCKS5, tunnel obfuscated to per-request targets.
    SocksClient,
}

impl From<Mode> for ListenerMode {
    fn from(mode: Mode) -> ListenerMode {
        match mode {
            Mode::SimpleClient => ListenerMode::SimpleClient,
            Mode::SimpleServer => ListenerMode::SimpleServer,
            Mode::SocksClient => ListenerMode::SocksClient,
        }
    }
}

impl ListenerConfig {
    /// Convert into the engine's parameter record.
    pub(crate) fn to_params(&self) -> Result<ListenerParams> {
        let protocol: ProtocolSpec = self
            .protocol
            .parse()
            .with_context(|| format!("Listener on {}", self.listen))?;
        Ok(ListenerParams {
            mode: self.mode.into(),
            listen: self.listen,
            target: self.target,
            protocol,
            idle_timeout: self.idle_timeout,
        })
    }
}

/// Load the configuration, apply `-o` overrides, and deserialize it.
pub(crate) fn load(file: Option<&Path>, overrides: &[String]) -> Result<ShroudConfig> {
    let mut value: toml::Value = match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Can't read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("Can't parse {}", path.display()))?
        }
        None => toml::Value::Table(toml::map::Map::new()),
    };
    for option in overrides {
        apply_override(&mut value, option)?;
    }
    value.try_into().context("Invalid configuration")
}

/// Apply one `-o KEY=VALUE` override to a parsed configuration tree.
///
/// Keys use dots to descend into tables; values use TOML syntax, with a
/// fallback to a bare string so that `-o logging.console=debug` works
/// without inner quotes.
fn apply_override(root: &mut toml::Value, option: &str) -> Result<()> {
    let (key, raw) = option
        .split_once('=')
        .with_context(|| format!("Bad override {option:?}: expected KEY=VALUE"))?;
    let parsed = parse_override_value(raw);

    let parts: Vec<&str> = key.split('.').collect();
    let (last, path) = parts.split_last().context("Empty override key")?;
    let mut cursor = root;
    for part in path {
        let table = cursor
            .as_table_mut()
            .with_context(|| format!("Override {key:?} descends into a non-table"))?;
        cursor = table
            .entry((*part).to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    cursor
        .as_table_mut()
        .with_context(|| format!("Override {key:?} descends into a non-table"))?
        .insert((*last).to_owned(), parsed);
    Ok(())
}

/// Parse an override value as TOML, or fall back to a plain string.
fn parse_override_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::map::Map<String, toml::Value>>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_owned()))
}

//! A traffic obfuscation proxy.
//!
//! Shroud tunnels TCP streams between an upstream peer and a downstream
//! peer, applying a pluggable obfuscation protocol on the wire in between.
//! It can run as a simple client (fixed target), a simple server (the
//! bridge side), or a local SOCKS5 proxy that picks targets per request.
//!
//! # Command-line interface
//!
//! `shroud` uses the [`clap`](https://docs.rs/clap/) crate for command-line
//! argument parsing; run `shroud help` to get it to print its
//! documentation. The only subcommand is `shroud proxy`.
//!
//! # Configuration
//!
//! The configuration file is TOML; see `shroud.example.toml` in this
//! crate for a commented example. Individual values can be overridden on
//! the command line with `-o KEY=VALUE`.
//!
//! # Shutdown
//!
//! The first SIGINT or SIGTERM stops accepting new connections and lets
//! live ones drain; a second signal closes them forcibly.

// @@ begin lint list @@
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![allow(clippy::print_stderr)] // Allowed in this crate only.
#![allow(clippy::print_stdout)] // Allowed in this crate only.
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list @@ -->

mod cfg;
mod logging;
mod process;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use shroud_engine::Engine;

use crate::cfg::ShroudConfig;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "shroud", version, about = "A traffic obfuscation proxy.")]
struct Cli {
    /// Specify which config file to read.
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        global = true
    )]
    config: Option<PathBuf>,

    /// Override config file parameters, using TOML-like syntax.
    #[arg(short = 'o', value_name = "KEY=VALUE", global = true)]
    option: Vec<String>,

    /// Override the log level (usually one of 'trace', 'debug', 'info',
    /// 'warn', 'error').
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// What to do.
    #[command(subcommand)]
    command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the configured listeners and proxy traffic until stopped.
    Proxy,
}

fn main() {
    if let Err(e) = main_main() {
        // The alternate format walks the whole cause chain.
        eprintln!("shroud: {:#}", e);
        std::process::exit(1);
    }
}

/// Inner function to allow convenient error handling.
fn main_main() -> Result<()> {
    let cli = Cli::parse();
    let config = cfg::load(cli.config.as_deref(), &cli.option)?;
    logging::setup(&config.logging, cli.log_level.as_deref())?;

    match cli.command {
        Command::Proxy => {
            if config.listeners.is_empty() {
                anyhow::bail!(
                    "No listeners configured; add a [[listener]] block to the config file"
                );
            }
            info!(
                "Starting shroud {} with {} listener(s)",
                env!("CARGO_PKG_VERSION"),
                config.listeners.len()
            );
            process::raise_file_limit(config.listeners.len());
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Initialize the async runtime")?;
            runtime.block_on(run(config))
        }
    }
}

/// Bring up the engine and all configured listeners, and run until a
/// shutdown completes.
async fn run(config: ShroudConfig) -> Result<()> {
    let engine = Engine::new();
    for listener in &config.listeners {
        let params = listener.to_params()?;
        let addr = params.listen;
        engine
            .add_listener(params)
            .await
            .with_context(|| format!("Can't listen on {}", addr))?;
    }

    shutdown_signal().await?;
    info!("Interrupt received; draining connections (interrupt again to abort them)");
    engine.free_all_listeners();
    engine.start_shutdown(false);

    tokio::select! {
        _ = engine.wait_shutdown() => {}
        r = shutdown_signal() => {
            r?;
            barbaric_finish(&engine).await;
        }
    }
    info!("Clean exit");
    Ok(())
}

/// Force-close everything that's still alive and wait for the registry to
/// empty out.
async fn barbaric_finish(engine: &Arc<Engine>) {
    info!("Aborting {} remaining connection(s)", engine.n_connections());
    engine.start_shutdown(true);
    engine.wait_shutdown().await;
}

/// Wait for a signal that means "stop".
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term =
        signal(SignalKind::terminate()).context("Install a SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("Wait for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

/// Wait for a signal that means "stop".
#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Wait for ctrl-c")
}

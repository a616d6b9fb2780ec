//! Common types and utilities shared across commands

use anyhow::Context;
use clap::Parser;
use std::future::Future;

/// Global CLI options available to all commands
#[derive(Parser, Debug, Clone, Default)]
pub struct GlobalOpts {
    #[arg(short, long, global = true, help = "Decrease verbosity")]
    pub quiet: bool,

    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Increase verbosity (-v for debug, -vv for trace)")]
    pub verbose: u8,

    #[arg(
        long,
        global = true,
        help = "Show worker stderr on console (always logged to file)"
    )]
    pub log_worker: bool,
}

impl GlobalOpts {
    /// Get the effective verbosity level
    /// - 0: quiet/warn only
    /// - 1: debug (-v)
    /// - 2: trace (-vv)
    pub fn verbosity_level(&self) -> u8 {
        if self.quiet {
            0
        } else {
            self.verbose
        }
    }
}

/// Run an async command body on a fresh multi-threaded runtime
pub fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

/// Install the `tracing` subscriber for library diagnostics
///
/// `RUST_LOG` wins; otherwise `-v` raises the bridge to debug and `-vv` to
/// trace.
pub fn init_tracing(opts: &GlobalOpts) {
    use tracing_subscriber::EnvFilter;

    let default = match opts.verbosity_level() {
        0 => "halftone_bridge=warn",
        1 => "halftone_bridge=debug",
        _ => "halftone_bridge=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

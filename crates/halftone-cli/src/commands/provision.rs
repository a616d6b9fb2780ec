use crate::common::block_on;
use crate::logger;
use crate::prompter::TerminalPrompter;
use crate::GlobalOpts;
use anyhow::Context;
use colored::Colorize;
use halftone_bridge::{prepare, NativeStatus, Startup, SystemRunner};
use halftone_config::Config;

/// Locate the runtime and install whatever the worker is missing
pub fn handle_provision(yes: bool, opts: &GlobalOpts) -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let startup = prepare_host(&config, yes)?;
    let provision = &startup.provision;

    if opts.quiet {
        return Ok(());
    }
    let (major, minor) = provision.runtime_version;
    println!("{}", "Provisioned:".bold().green());
    println!(
        "  {}: {} ({}.{})",
        "runtime".cyan(),
        provision.runtime_command,
        major,
        minor
    );
    if provision.installed.is_empty() {
        println!("  {}: {}", "installed".cyan(), "nothing, all present".dimmed());
    } else {
        println!("  {}: {}", "installed".cyan(), provision.installed.join(", "));
    }
    let native = match provision.native {
        NativeStatus::NotRequired => "not required".dimmed(),
        NativeStatus::Present => "present".green(),
        NativeStatus::Installed => "installed".green(),
        NativeStatus::Degraded(ref why) => format!("unavailable ({})", why).yellow(),
    };
    println!("  {}: {}", "native library".cyan(), native);
    Ok(())
}

/// Run startup with terminal dialogs; shared by every worker-backed command
pub fn prepare_host(config: &Config, assume_yes: bool) -> anyhow::Result<Startup> {
    let runner = SystemRunner::new();
    let prompter = TerminalPrompter::new(assume_yes);
    let startup = block_on(prepare(config, &runner, &prompter))??;
    logger::debug(&format!(
        "Runtime {} ready, raster export {}",
        startup.provision.runtime_command,
        if startup.provision.raster_export_available() {
            "available"
        } else {
            "disabled"
        }
    ));
    Ok(startup)
}

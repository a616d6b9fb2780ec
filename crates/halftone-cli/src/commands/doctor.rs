use crate::common::block_on;
use crate::logger;
use crate::GlobalOpts;
use anyhow::Context;
use colored::Colorize;
use halftone_bridge::{HostOs, PackageRequirement, ProvisionTimeouts, RuntimeLocator, SystemRunner};
use halftone_config::Config;

/// Report what discovery finds on this host without installing anything
pub fn handle_doctor(opts: &GlobalOpts) -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let strategy = HostOs::current().strategy();
    let timeouts = ProvisionTimeouts::from_config(&config);
    let runner = SystemRunner::new();

    logger::debug("Running runtime discovery");
    let located = block_on(
        RuntimeLocator::new(&runner, strategy)
            .with_min_version(config.min_python())
            .with_timeouts(timeouts.check, timeouts.install)
            .with_override(config.resolved_runtime())
            .locate(),
    )?;

    println!("{}", "Runtime:".bold().green());
    match located {
        Ok(runtime) => {
            let (major, minor) = runtime.version;
            println!("  {}: {}", "interpreter".cyan(), runtime.runtime);
            println!("  {}: {}.{}", "version".cyan(), major, minor);
            println!("  {}: {}", "package manager".cyan(), runtime.package_manager);
            println!("  {}: {:?}", "pairing".cyan(), runtime.pairing);
        }
        Err(e) => {
            println!("  {}", "not found".red());
            if opts.verbosity_level() > 0 {
                println!("  {}", e);
            }
        }
    }

    println!("{}", "Worker:".bold().green());
    let script = config.worker_script_path();
    let marker = if script.is_file() {
        "found".green()
    } else {
        "missing".red()
    };
    println!("  {}: {} ({})", "script".cyan(), script.display(), marker);
    let packages: Vec<String> = PackageRequirement::from_config(&config)
        .into_iter()
        .map(|p| p.install_name)
        .collect();
    println!("  {}: {}", "packages".cyan(), packages.join(", "));

    println!("{}", "Files:".bold().green());
    println!("  {}: {}", "config".cyan(), Config::path()?.display());
    if let Some(log) = logger::get_log_path() {
        println!("  {}: {}", "log".cyan(), log.display());
    }
    Ok(())
}

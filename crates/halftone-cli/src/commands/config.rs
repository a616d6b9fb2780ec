use crate::logger;
use crate::GlobalOpts;
use anyhow::{anyhow, Context};
use clap::Subcommand;
use colored::Colorize;
use halftone_config::{Config, KNOWN_KEYS};

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Print every key that is set
    Show,
    /// Print one key, or its default when unset
    Get { key: String },
    /// Set a key and save the file
    Set { key: String, value: String },
    /// Print the path of the config file in use
    Path,
}

pub fn handle_config(action: Option<ConfigAction>, opts: &GlobalOpts) -> anyhow::Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let config = Config::load().context("Failed to load config")?;
            println!("{}", "Configuration:".bold().green());
            if config.is_empty() {
                if opts.verbosity_level() > 0 {
                    println!("  {}", "(empty, using defaults)".yellow());
                }
            } else {
                for (key, value) in config.values_iter() {
                    println!("  {}: {}", key.cyan(), value);
                }
            }
        }
        ConfigAction::Get { key } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(anyhow!(
                    "Unknown config key: {}. Known keys: {}",
                    key,
                    KNOWN_KEYS.join(", ")
                ));
            }
            let config = Config::load().context("Failed to load config")?;
            match config.get(&key) {
                Some(value) => println!("{}", value),
                None => println!("{}", effective_default(&config, &key)),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load().context("Failed to load config")?;
            config.set(&key, value.clone())?;
            config.save().context("Failed to save config")?;
            logger::success(&format!("Set {} = {}", key, value));
        }
        ConfigAction::Path => {
            let path = Config::path()?;
            logger::debug(&format!("Reading config from: {}", path.display()));
            println!("{}", path.display());
        }
    }
    Ok(())
}

/// Value a key takes when the file does not set it
fn effective_default(config: &Config, key: &str) -> String {
    let secs = |d: std::time::Duration| d.as_secs().to_string();
    match key {
        "runtime" => "(discovered)".to_string(),
        "worker-script" => config.worker_script_path().display().to_string(),
        "min-python" => {
            let (major, minor) = config.min_python();
            format!("{}.{}", major, minor)
        }
        "packages" => config
            .packages()
            .iter()
            .map(|(import, install)| format!("{}={}", import, install))
            .collect::<Vec<_>>()
            .join(","),
        "raster-export" => config.raster_export().to_string(),
        "timeouts.version-check" => secs(config.timeouts.version_check()),
        "timeouts.probe" => secs(config.timeouts.probe()),
        "timeouts.install" => secs(config.timeouts.install()),
        "timeouts.native-install" => secs(config.timeouts.native_install()),
        "timeouts.ready" => secs(config.timeouts.ready()),
        "timeouts.ingest" => secs(config.timeouts.ingest()),
        "timeouts.recompute" => secs(config.timeouts.recompute()),
        "timeouts.export" => secs(config.timeouts.export()),
        "timeouts.ping" => secs(config.timeouts.ping()),
        "restart.max-restarts" => config.restart.max_restarts().to_string(),
        "restart.backoff-ms" => config.restart.backoff_ms().to_string(),
        "restart.backoff-max-ms" => config.restart.backoff_max_ms().to_string(),
        _ => String::new(),
    }
}

//! Startup dependency provisioning
//!
//! Makes sure every package the worker imports is installed for the located
//! runtime, then (on macOS) offers to install the native library that raster
//! export needs.

mod install;
mod native;
mod probe;

pub use install::{InstallStrategy, EXTERNALLY_MANAGED_MARKER};
pub use probe::{parse_probe_output, probe_script};

use crate::errors::{BridgeError, Result};
use crate::locator::{LocatedRuntime, PackageManager};
use crate::platform::{NativeLibrary, PlatformStrategy};
use crate::prompt::Prompter;
use crate::runner::{CommandRunner, Invocation};
use halftone_config::Config;
use halftone_logger as logger;
use std::time::Duration;

/// Name used to test for a package, and the name used to install it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequirement {
    pub import_name: String,
    pub install_name: String,
}

impl PackageRequirement {
    pub fn new(import_name: &str, install_name: &str) -> Self {
        Self {
            import_name: import_name.to_string(),
            install_name: install_name.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Vec<Self> {
        config
            .packages()
            .into_iter()
            .map(|(import_name, install_name)| Self {
                import_name,
                install_name,
            })
            .collect()
    }
}

/// Outcome of the optional native-library step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeStatus {
    /// This OS (or configuration) has no native step
    NotRequired,
    Present,
    Installed,
    /// Raster export is unavailable; the reason is user-facing
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub runtime_command: String,
    pub runtime_version: (u8, u8),
    /// Install names that were installed during this run
    pub installed: Vec<String>,
    pub native: NativeStatus,
}

impl ProvisionResult {
    pub fn raster_export_available(&self) -> bool {
        !matches!(self.native, NativeStatus::Degraded(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionTimeouts {
    pub check: Duration,
    pub probe: Duration,
    pub install: Duration,
    pub native_install: Duration,
}

impl Default for ProvisionTimeouts {
    fn default() -> Self {
        Self {
            check: Duration::from_secs(10),
            probe: Duration::from_secs(30),
            install: Duration::from_secs(300),
            native_install: Duration::from_secs(600),
        }
    }
}

impl ProvisionTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            check: config.timeouts.version_check(),
            probe: config.timeouts.probe(),
            install: config.timeouts.install(),
            native_install: config.timeouts.native_install(),
        }
    }
}

pub struct DependencyProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    strategy: &'static PlatformStrategy,
    prompter: &'a dyn Prompter,
    requirements: Vec<PackageRequirement>,
    timeouts: ProvisionTimeouts,
    native: Option<&'a NativeLibrary>,
}

impl<'a> DependencyProvisioner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        strategy: &'static PlatformStrategy,
        prompter: &'a dyn Prompter,
        requirements: Vec<PackageRequirement>,
    ) -> Self {
        Self {
            runner,
            strategy,
            prompter,
            requirements,
            timeouts: ProvisionTimeouts::default(),
            native: strategy.native_library.as_ref(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ProvisionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replace the platform's native library; `None` skips the native step
    pub fn with_native_library(mut self, native: Option<&'a NativeLibrary>) -> Self {
        self.native = native;
        self
    }

    pub async fn provision(&self, runtime: &LocatedRuntime) -> Result<ProvisionResult> {
        let missing = self.missing_packages(&runtime.runtime).await;

        let installed = if missing.is_empty() {
            logger::debug("All required packages are importable");
            Vec::new()
        } else {
            self.install(&runtime.package_manager, &missing).await?
        };

        let native = match self.native {
            Some(library) => self.ensure_native(library).await,
            None => NativeStatus::NotRequired,
        };

        Ok(ProvisionResult {
            runtime_command: runtime.runtime.clone(),
            runtime_version: runtime.version,
            installed,
            native,
        })
    }

    /// Requirements that fail to import; all of them if the probe cannot run
    pub async fn missing_packages(&self, runtime: &str) -> Vec<PackageRequirement> {
        let script = probe_script(&self.requirements);
        let inv = Invocation::new(runtime, self.timeouts.probe).args(["-c", script.as_str()]);

        match self.runner.run(&inv).await {
            Ok(output) if output.success() => {
                let missing = parse_probe_output(&output.stdout, &self.requirements);
                if !missing.is_empty() {
                    logger::info(&format!(
                        "Missing packages: {}",
                        missing
                            .iter()
                            .map(|r| r.install_name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                missing
            }
            Ok(output) => {
                logger::warn(&format!(
                    "Package probe exited with {:?}; assuming every package is missing",
                    output.code
                ));
                self.requirements.clone()
            }
            Err(e) => {
                logger::warn(&format!(
                    "Package probe failed ({}); assuming every package is missing",
                    e
                ));
                self.requirements.clone()
            }
        }
    }

    async fn install(
        &self,
        package_manager: &PackageManager,
        missing: &[PackageRequirement],
    ) -> Result<Vec<String>> {
        let names: Vec<String> = missing.iter().map(|r| r.install_name.clone()).collect();
        logger::spinner_start(&format!("Installing {}...", names.join(", ")));

        let mut last_failure: Option<String> = None;
        for strategy in InstallStrategy::ORDER {
            if !strategy.applies_after(last_failure.as_deref()) {
                logger::debug(&format!("Skipping {} install strategy", strategy.label()));
                continue;
            }

            let inv = package_manager
                .invocation(self.timeouts.install)
                .arg("install")
                .args(strategy.flag())
                .args(names.iter().cloned());

            match self.runner.run(&inv).await {
                Ok(output) if output.success() => {
                    logger::spinner_success(&format!(
                        "Installed {} ({} install)",
                        names.join(", "),
                        strategy.label()
                    ));
                    return Ok(names);
                }
                Ok(output) => {
                    logger::debug(&format!(
                        "{} install failed with {:?}",
                        strategy.label(),
                        output.code
                    ));
                    last_failure = Some(output.combined());
                }
                Err(e) => {
                    logger::debug(&format!("{} install failed: {}", strategy.label(), e));
                    last_failure = Some(e.to_string());
                }
            }
        }

        logger::spinner_error(&format!("Failed to install {}", names.join(", ")));
        let remedy = self
            .strategy
            .install_remediation(&package_manager.to_string(), &names);
        self.prompter
            .fatal("Missing Python packages", &format!("Halftone Studio could not install its image libraries.\n\n{}", remedy));
        Err(BridgeError::DependencyInstallFailed {
            packages: names,
            remedy,
        })
    }
}

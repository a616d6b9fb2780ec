//! Halftone Studio worker bridge
//!
//! Finds a Python runtime, installs the worker's packages, runs the image
//! worker as a child process and exchanges newline-delimited JSON with it.
//!
//! Startup ([`prepare`]) runs once and its failures are fatal to the host.
//! After that a [`Bridge`] owns the worker and serves image commands.

pub mod commands;
pub mod dispatcher;
pub mod errors;
pub mod framer;
pub mod locator;
pub mod platform;
pub mod prompt;
pub mod provisioner;
pub mod runner;
pub mod supervisor;

pub use commands::{
    Bridge, CommandTimeouts, Dot, DotShape, ExportFormat, ExportResult, IngestResult,
    PatternParams, PatternResult, SessionId,
};
pub use errors::{BridgeError, Result};
pub use locator::{LocatedRuntime, PackageManager, Pairing, RuntimeLocator};
pub use platform::{HostOs, PlatformStrategy};
pub use prompt::{NonInteractive, Prompter};
pub use provisioner::{
    DependencyProvisioner, NativeStatus, PackageRequirement, ProvisionResult, ProvisionTimeouts,
};
pub use runner::{CommandRunner, SystemRunner};
pub use supervisor::{Supervisor, SupervisorSettings, WorkerCommand, WorkerStatus};

use halftone_config::Config;

/// Everything startup discovered about the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub runtime: LocatedRuntime,
    pub provision: ProvisionResult,
}

impl Startup {
    /// Worker command for the located runtime and the configured script
    pub fn worker_command(&self, config: &Config) -> WorkerCommand {
        WorkerCommand::for_host(&self.runtime.runtime, &config.worker_script_path())
    }

    /// A bridge for this host, with raster export disabled when the native
    /// library step degraded
    pub fn bridge(&self, config: &Config) -> Bridge {
        let bridge = Bridge::from_config(config);
        match (&self.provision.native, HostOs::current().strategy().native_library.as_ref()) {
            (NativeStatus::Degraded(_), Some(library)) => bridge.disable_raster_export(library.name),
            _ => bridge,
        }
    }
}

/// Locate a runtime for this host, then provision its packages
///
/// A missing runtime is reported through `prompter.fatal` before the error
/// is returned; install failures are reported by the provisioner.
pub async fn prepare(
    config: &Config,
    runner: &dyn CommandRunner,
    prompter: &dyn Prompter,
) -> Result<Startup> {
    prepare_for(HostOs::current().strategy(), config, runner, prompter).await
}

pub async fn prepare_for(
    strategy: &'static PlatformStrategy,
    config: &Config,
    runner: &dyn CommandRunner,
    prompter: &dyn Prompter,
) -> Result<Startup> {
    let timeouts = ProvisionTimeouts::from_config(config);

    let runtime = RuntimeLocator::new(runner, strategy)
        .with_min_version(config.min_python())
        .with_timeouts(timeouts.check, timeouts.install)
        .with_override(config.resolved_runtime())
        .locate()
        .await;
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            prompter.fatal("Python not found", &e.to_string());
            return Err(e);
        }
    };
    tracing::debug!(runtime = %runtime.runtime, pairing = ?runtime.pairing, "runtime located");

    let mut provisioner = DependencyProvisioner::new(
        runner,
        strategy,
        prompter,
        PackageRequirement::from_config(config),
    )
    .with_timeouts(timeouts);
    if !config.raster_export() {
        provisioner = provisioner.with_native_library(None);
    }
    let provision = provisioner.provision(&runtime).await?;

    Ok(Startup { runtime, provision })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::recording::RecordingPrompter;
    use crate::runner::scripted::ScriptedRunner;

    #[tokio::test]
    async fn test_prepare_happy_path() {
        let runner = ScriptedRunner::new();
        runner
            .ok("python3 --version", "Python 3.12.1\n")
            .ok("python3 -m pip --version", "pip 24.0 from /usr/lib/python3/dist-packages/pip (python 3.12)\n")
            .ok("python3 -c *", "ok:numpy\nok:cv2\nok:PIL\nok:cairosvg\n");
        let prompter = RecordingPrompter::answering(true);

        let startup = prepare_for(HostOs::Linux.strategy(), &Config::default(), &runner, &prompter).await;
        let startup = startup.unwrap();
        assert_eq!(startup.runtime.runtime, "python3");
        assert!(startup.provision.installed.is_empty());
        assert_eq!(startup.provision.native, NativeStatus::NotRequired);
        assert!(prompter.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_reports_missing_runtime_as_fatal() {
        let runner = ScriptedRunner::new();
        let prompter = RecordingPrompter::answering(true);

        let result = prepare_for(HostOs::Linux.strategy(), &Config::default(), &runner, &prompter).await;
        assert!(matches!(result, Err(BridgeError::RuntimeNotFound(_))));
        assert_eq!(prompter.kinds(), vec!["fatal".to_string()]);
    }
}

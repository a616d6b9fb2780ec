//! Optional native library step (cairo through Homebrew on macOS)
//!
//! Never fails provisioning: every outcome other than present/installed is
//! reported as [`NativeStatus::Degraded`] and raster export is disabled.

use super::{DependencyProvisioner, NativeStatus};
use crate::platform::NativeLibrary;
use crate::runner::{locate_executable, Invocation};
use halftone_logger as logger;
use std::path::{Path, PathBuf};

impl DependencyProvisioner<'_> {
    pub(super) async fn ensure_native(&self, library: &NativeLibrary) -> NativeStatus {
        if library.search_paths.iter().any(|p| Path::new(p).is_file()) {
            logger::debug(&format!("Native library {} found", library.name));
            return NativeStatus::Present;
        }

        let Some(manager) = self.find_formula_manager(library).await else {
            let reason = format!(
                "{} is unavailable because {} is not installed and {} was not found",
                library.affects, library.name, library.formula_manager
            );
            self.prompter.inform(
                "Limited export",
                &format!(
                    "{}.\nSVG export still works. Install {} to enable it.",
                    reason, library.formula_manager
                ),
            );
            return NativeStatus::Degraded(reason);
        };
        let manager = manager.to_string_lossy().into_owned();

        // Installed under a prefix we do not search
        let listed = Invocation::new(manager.as_str(), self.timeouts.check)
            .args(["list", "--versions", library.formula]);
        if let Ok(output) = self.runner.run(&listed).await {
            if output.success() && !output.stdout.trim().is_empty() {
                return NativeStatus::Present;
            }
        }

        let question = format!(
            "{} needs the {} library. Install it now with `{} install {}`? This can take several minutes.",
            library.affects, library.name, library.formula_manager, library.formula
        );
        if !self.prompter.confirm("Install native library", &question) {
            logger::warn(&format!("{} disabled: {} install declined", library.affects, library.name));
            return NativeStatus::Degraded(format!(
                "{} is unavailable because installing {} was declined",
                library.affects, library.name
            ));
        }

        logger::spinner_start(&format!("Installing {}...", library.name));
        let install = Invocation::new(manager.as_str(), self.timeouts.native_install)
            .args(["install", library.formula]);
        let failure = match self.runner.run(&install).await {
            Ok(output) if output.success() => {
                logger::spinner_success(&format!("Installed {}", library.name));
                return NativeStatus::Installed;
            }
            Ok(output) => output.stderr.trim().to_string(),
            Err(e) => e.to_string(),
        };

        logger::spinner_error(&format!("Failed to install {}", library.name));
        let reason = format!(
            "{} is unavailable because `{} install {}` failed",
            library.affects, library.formula_manager, library.formula
        );
        self.prompter.inform(
            "Limited export",
            &format!("{}.\n{}\nSVG export still works.", reason, failure),
        );
        NativeStatus::Degraded(reason)
    }

    async fn find_formula_manager(&self, library: &NativeLibrary) -> Option<PathBuf> {
        if let Some(path) = locate_executable(
            self.runner,
            self.strategy,
            library.formula_manager,
            self.timeouts.check,
        )
        .await
        {
            return Some(path);
        }

        self.strategy
            .extra_bin_dirs
            .iter()
            .map(|dir| Path::new(dir).join(library.formula_manager))
            .find(|path| path.is_file())
    }
}

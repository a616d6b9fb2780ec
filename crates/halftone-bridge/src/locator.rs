//! Python runtime and package-manager discovery
//!
//! Finds an interpreter the worker can run on and a pip that installs into
//! it. Discovery order:
//! 1. Configured runtime override (if any)
//! 2. Each platform candidate with a compatible version and `-m pip`
//! 3. A standalone pip on PATH and the interpreter next to its prefix
//! 4. A standalone pip paired with any compatible candidate
//! 5. A compatible candidate with pip bootstrapped through `ensurepip`

use crate::errors::{BridgeError, Result};
use crate::platform::PlatformStrategy;
use crate::runner::{locate_executable, CommandRunner, Invocation};
use halftone_config::DEFAULT_MIN_PYTHON;
use halftone_logger as logger;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the package manager is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageManager {
    /// `<runtime> -m pip`
    Module { runtime: String },
    /// A pip executable found on its own
    Standalone(PathBuf),
}

impl PackageManager {
    /// Invocation prefix; callers append the pip subcommand
    pub fn invocation(&self, timeout: Duration) -> Invocation {
        match self {
            PackageManager::Module { runtime } => {
                Invocation::new(runtime.clone(), timeout).args(["-m", "pip"])
            }
            PackageManager::Standalone(path) => {
                Invocation::new(path.to_string_lossy().into_owned(), timeout)
            }
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Module { runtime } => write!(f, "{} -m pip", runtime),
            PackageManager::Standalone(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Which discovery step produced the pair, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    Configured,
    Verified,
    Derived,
    Loose,
    Bootstrapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedRuntime {
    /// Command used to start the interpreter (bare name or path)
    pub runtime: String,
    pub version: (u8, u8),
    pub package_manager: PackageManager,
    pub pairing: Pairing,
}

pub struct RuntimeLocator<'a> {
    runner: &'a dyn CommandRunner,
    strategy: &'static PlatformStrategy,
    min_version: (u8, u8),
    check_timeout: Duration,
    bootstrap_timeout: Duration,
    runtime_override: Option<PathBuf>,
}

impl<'a> RuntimeLocator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, strategy: &'static PlatformStrategy) -> Self {
        Self {
            runner,
            strategy,
            min_version: DEFAULT_MIN_PYTHON,
            check_timeout: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(120),
            runtime_override: None,
        }
    }

    pub fn with_min_version(mut self, min_version: (u8, u8)) -> Self {
        self.min_version = min_version;
        self
    }

    pub fn with_timeouts(mut self, check: Duration, bootstrap: Duration) -> Self {
        self.check_timeout = check;
        self.bootstrap_timeout = bootstrap;
        self
    }

    pub fn with_override(mut self, runtime: Option<PathBuf>) -> Self {
        self.runtime_override = runtime;
        self
    }

    pub async fn locate(&self) -> Result<LocatedRuntime> {
        logger::debug("Starting Python discovery");
        let mut tried: Vec<String> = Vec::new();

        if let Some(ref path) = self.runtime_override {
            let runtime = path.to_string_lossy().into_owned();
            if let Some(found) = self.try_configured(&runtime, &mut tried).await {
                return Ok(found);
            }
            logger::warn(&format!(
                "Configured runtime {} is not usable, falling back to discovery",
                runtime
            ));
        }

        // Candidates that run and are new enough but have no pip
        let mut without_pip: Option<(String, (u8, u8))> = None;

        for candidate in self.strategy.runtime_candidates {
            let Some(version) = self.runtime_version(candidate).await else {
                tried.push(format!("{}: not runnable", candidate));
                continue;
            };
            if !self.compatible(version) {
                tried.push(format!(
                    "{}: Python {}.{} is older than {}.{}",
                    candidate, version.0, version.1, self.min_version.0, self.min_version.1
                ));
                continue;
            }
            if self.has_module_pip(candidate).await {
                logger::info(&format!(
                    "Using Python {}.{} at {}",
                    version.0, version.1, candidate
                ));
                return Ok(LocatedRuntime {
                    runtime: (*candidate).to_string(),
                    version,
                    package_manager: PackageManager::Module {
                        runtime: (*candidate).to_string(),
                    },
                    pairing: Pairing::Verified,
                });
            }
            tried.push(format!("{}: pip module missing", candidate));
            if without_pip.is_none() {
                without_pip = Some(((*candidate).to_string(), version));
            }
        }

        if let Some((pip, banner)) = self.find_standalone_pip().await {
            if let Some(found) = self.derive_runtime(&pip, &banner).await {
                logger::warn(&format!(
                    "Using {} derived from standalone {}; the pairing is best-effort",
                    found.runtime,
                    pip.display()
                ));
                return Ok(found);
            }
            tried.push(format!("{}: no interpreter next to it", pip.display()));

            if let Some((runtime, version)) = without_pip.clone() {
                logger::warn(&format!(
                    "Pairing {} with unrelated {}; versions may not match",
                    runtime,
                    pip.display()
                ));
                return Ok(LocatedRuntime {
                    runtime,
                    version,
                    package_manager: PackageManager::Standalone(pip),
                    pairing: Pairing::Loose,
                });
            }
        }

        if let Some((runtime, version)) = without_pip {
            if self.bootstrap_pip(&runtime).await {
                logger::info(&format!("Bootstrapped pip for {}", runtime));
                return Ok(LocatedRuntime {
                    package_manager: PackageManager::Module {
                        runtime: runtime.clone(),
                    },
                    runtime,
                    version,
                    pairing: Pairing::Bootstrapped,
                });
            }
            tried.push(format!("{}: ensurepip failed", runtime));
        }

        Err(BridgeError::RuntimeNotFound(format!(
            "Python {}.{}+ with pip is required. {}\nTried: {}",
            self.min_version.0,
            self.min_version.1,
            self.strategy.runtime_remediation(),
            tried.join("; ")
        )))
    }

    async fn try_configured(&self, runtime: &str, tried: &mut Vec<String>) -> Option<LocatedRuntime> {
        let version = self.runtime_version(runtime).await.filter(|v| self.compatible(*v));
        let Some(version) = version else {
            tried.push(format!("{} (configured): unusable", runtime));
            return None;
        };
        if self.has_module_pip(runtime).await || self.bootstrap_pip(runtime).await {
            return Some(LocatedRuntime {
                runtime: runtime.to_string(),
                version,
                package_manager: PackageManager::Module {
                    runtime: runtime.to_string(),
                },
                pairing: Pairing::Configured,
            });
        }
        tried.push(format!("{} (configured): pip unavailable", runtime));
        None
    }

    fn compatible(&self, version: (u8, u8)) -> bool {
        version.0 == self.min_version.0 && version >= self.min_version
    }

    async fn runtime_version(&self, runtime: &str) -> Option<(u8, u8)> {
        let inv = Invocation::new(runtime, self.check_timeout).arg("--version");
        match self.runner.run(&inv).await {
            // Python 2 prints its banner on stderr
            Ok(output) if output.success() => parse_python_version(&output.combined()),
            _ => None,
        }
    }

    async fn has_module_pip(&self, runtime: &str) -> bool {
        let inv = Invocation::new(runtime, self.check_timeout).args(["-m", "pip", "--version"]);
        matches!(self.runner.run(&inv).await, Ok(output) if output.success())
    }

    async fn bootstrap_pip(&self, runtime: &str) -> bool {
        logger::step(&format!("Bootstrapping pip for {}", runtime));
        let inv = Invocation::new(runtime, self.bootstrap_timeout).args(["-m", "ensurepip", "--upgrade"]);
        match self.runner.run(&inv).await {
            Ok(output) if output.success() => self.has_module_pip(runtime).await,
            _ => false,
        }
    }

    async fn find_standalone_pip(&self) -> Option<(PathBuf, String)> {
        for name in self.strategy.package_managers {
            let Some(path) =
                locate_executable(self.runner, self.strategy, name, self.check_timeout).await
            else {
                continue;
            };
            let inv = Invocation::new(path.to_string_lossy().into_owned(), self.check_timeout)
                .arg("--version");
            if let Ok(output) = self.runner.run(&inv).await {
                if output.success() {
                    return Some((path, output.stdout));
                }
            }
        }
        None
    }

    /// Walk up from pip's install prefix looking for a sibling interpreter
    async fn derive_runtime(&self, pip: &Path, banner: &str) -> Option<LocatedRuntime> {
        let prefix = parse_pip_prefix(banner)?;
        for dir in prefix.ancestors() {
            for relative in self.strategy.derived_runtime_paths {
                let candidate = self.strategy.join_relative(dir, relative);
                if !candidate.is_file() {
                    continue;
                }
                let runtime = candidate.to_string_lossy().into_owned();
                match self.runtime_version(&runtime).await {
                    Some(version) if self.compatible(version) => {
                        return Some(LocatedRuntime {
                            runtime,
                            version,
                            package_manager: PackageManager::Standalone(pip.to_path_buf()),
                            pairing: Pairing::Derived,
                        });
                    }
                    _ => logger::debug(&format!("Derived {} is not usable", runtime)),
                }
            }
        }
        None
    }
}

/// Parse `Python 3.11.4` into `(3, 11)`
pub fn parse_python_version(text: &str) -> Option<(u8, u8)> {
    text.split_whitespace()
        .skip_while(|word| *word != "Python")
        .nth(1)
        .and_then(halftone_config::parse_version)
}

/// Extract the install location from `pip X.Y from <path> (python A.B)`
pub fn parse_pip_prefix(banner: &str) -> Option<PathBuf> {
    let line = crate::runner::first_line(banner)?;
    let (_, rest) = line.split_once(" from ")?;
    let path = match rest.rfind(" (python") {
        Some(end) => &rest[..end],
        None => rest,
    };
    let path = path.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostOs;
    use crate::runner::scripted::ScriptedRunner;
    use tempfile::TempDir;

    fn linux() -> &'static PlatformStrategy {
        HostOs::Linux.strategy()
    }

    #[test]
    fn test_parse_python_version() {
        assert_eq!(parse_python_version("Python 3.12.1\n"), Some((3, 12)));
        assert_eq!(parse_python_version("\nPython 2.7.18"), Some((2, 7)));
        assert_eq!(parse_python_version("command not found"), None);
    }

    #[test]
    fn test_parse_pip_prefix() {
        let banner = "pip 23.2.1 from /usr/lib/python3/dist-packages/pip (python 3.11)\n";
        assert_eq!(
            parse_pip_prefix(banner),
            Some(PathBuf::from("/usr/lib/python3/dist-packages/pip"))
        );
        let spaced = "pip 24.0 from /Users/me/Library/Application Support/py/pip (python 3.12)";
        assert_eq!(
            parse_pip_prefix(spaced),
            Some(PathBuf::from("/Users/me/Library/Application Support/py/pip"))
        );
        assert_eq!(parse_pip_prefix("pip: command not found"), None);
    }

    #[tokio::test]
    async fn test_first_candidate_with_pip_wins() {
        let runner = ScriptedRunner::new();
        runner
            .ok("python3 --version", "Python 3.12.1")
            .ok("python3 -m pip --version", "pip 24.0 from /x (python 3.12)");

        let found = RuntimeLocator::new(&runner, linux()).locate().await;
        let Ok(found) = found else {
            panic!("expected a runtime, got {:?}", found);
        };
        assert_eq!(found.runtime, "python3");
        assert_eq!(found.version, (3, 12));
        assert_eq!(found.pairing, Pairing::Verified);
        assert_eq!(found.package_manager.to_string(), "python3 -m pip");
    }

    #[tokio::test]
    async fn test_too_old_candidate_is_skipped() {
        let runner = ScriptedRunner::new();
        runner
            .ok("python3 --version", "Python 3.6.9")
            .ok("python --version", "Python 3.11.2")
            .ok("python -m pip --version", "pip 22.0");

        let found = RuntimeLocator::new(&runner, linux()).locate().await;
        assert!(found.is_ok_and(|f| f.runtime == "python" && f.version == (3, 11)));
        assert_eq!(runner.count("python3 -m pip"), 0);
    }

    #[tokio::test]
    async fn test_standalone_pip_derives_sibling_runtime() {
        let Ok(prefix) = TempDir::new() else {
            return;
        };
        let site = prefix.path().join("lib").join("python3.11").join("site-packages").join("pip");
        let bin = prefix.path().join("bin");
        assert!(std::fs::create_dir_all(&site).is_ok());
        assert!(std::fs::create_dir_all(&bin).is_ok());
        let derived = bin.join("python3");
        assert!(std::fs::write(&derived, "").is_ok());

        let runner = ScriptedRunner::new();
        runner
            .ok("which pip3", "/opt/tools/bin/pip3\n")
            .ok(
                "/opt/tools/bin/pip3 --version",
                &format!("pip 23.0 from {} (python 3.11)", site.display()),
            )
            .ok(&format!("{} --version", derived.display()), "Python 3.11.7");

        let found = RuntimeLocator::new(&runner, linux()).locate().await;
        let Ok(found) = found else {
            panic!("expected derived runtime, got {:?}", found);
        };
        assert_eq!(found.pairing, Pairing::Derived);
        assert_eq!(found.runtime, derived.to_string_lossy());
        assert_eq!(
            found.package_manager,
            PackageManager::Standalone(PathBuf::from("/opt/tools/bin/pip3"))
        );
    }

    #[tokio::test]
    async fn test_standalone_pip_loosely_paired_with_candidate() {
        let runner = ScriptedRunner::new();
        runner
            .ok("python3 --version", "Python 3.10.12")
            .fail("python3 -m pip --version", "No module named pip")
            .ok("which pip3", "/usr/local/bin/pip3")
            .ok("/usr/local/bin/pip3 --version", "pip 21.0 from /nowhere/pip (python 3.8)");

        let found = RuntimeLocator::new(&runner, linux()).locate().await;
        let Ok(found) = found else {
            panic!("expected a loose pairing, got {:?}", found);
        };
        assert_eq!(found.pairing, Pairing::Loose);
        assert_eq!(found.runtime, "python3");
        assert_eq!(runner.count("python3 -m ensurepip"), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_pip_when_nothing_else_works() {
        let runner = ScriptedRunner::new();
        runner
            .ok("python3 --version", "Python 3.12.3")
            .fail("python3 -m pip --version", "No module named pip")
            .ok("python3 -m pip --version", "pip 24.0 from /usr/lib (python 3.12)")
            .ok("python3 -m ensurepip --upgrade", "Successfully installed pip");

        let found = RuntimeLocator::new(&runner, linux()).locate().await;
        assert!(found.is_ok_and(|f| f.pairing == Pairing::Bootstrapped && f.runtime == "python3"));
        assert_eq!(runner.count("python3 -m ensurepip --upgrade"), 1);
    }

    #[tokio::test]
    async fn test_runtime_not_found_lists_attempts() {
        let runner = ScriptedRunner::new();
        let result = RuntimeLocator::new(&runner, linux()).locate().await;
        let Err(BridgeError::RuntimeNotFound(message)) = result else {
            panic!("expected RuntimeNotFound, got {:?}", result);
        };
        assert!(message.contains("python3: not runnable"));
        assert!(message.contains("/usr/local/bin/python3: not runnable"));
        assert!(message.contains("python3-pip"));
    }

    #[tokio::test]
    async fn test_configured_runtime_takes_precedence() {
        let runner = ScriptedRunner::new();
        runner
            .ok("/opt/py/bin/python3.12 --version", "Python 3.12.0")
            .ok("/opt/py/bin/python3.12 -m pip --version", "pip 24.0")
            .ok("python3 --version", "Python 3.11.0")
            .ok("python3 -m pip --version", "pip 23.0");

        let found = RuntimeLocator::new(&runner, linux())
            .with_override(Some(PathBuf::from("/opt/py/bin/python3.12")))
            .locate()
            .await;
        assert!(found.is_ok_and(|f| f.pairing == Pairing::Configured));
        assert_eq!(runner.count("python3 --version"), 0);
    }
}

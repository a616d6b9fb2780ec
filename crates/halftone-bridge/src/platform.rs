//! Per-OS strategy table
//!
//! Everything that differs between macOS, Linux and Windows during discovery,
//! provisioning and worker spawn is looked up here instead of being spread
//! across `cfg!` branches.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOs {
    MacOs,
    Linux,
    Windows,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else if cfg!(target_os = "windows") {
            HostOs::Windows
        } else {
            HostOs::Linux
        }
    }

    pub fn strategy(self) -> &'static PlatformStrategy {
        match self {
            HostOs::MacOs => &MACOS,
            HostOs::Linux => &LINUX,
            HostOs::Windows => &WINDOWS,
        }
    }
}

/// Optional native shared library installed through a formula manager
#[derive(Debug)]
pub struct NativeLibrary {
    pub name: &'static str,
    /// Files whose presence means the library is installed
    pub search_paths: &'static [&'static str],
    /// Second-level package manager, e.g. `brew`
    pub formula_manager: &'static str,
    pub formula: &'static str,
    /// What stops working without the library
    pub affects: &'static str,
}

#[derive(Debug)]
pub struct PlatformStrategy {
    pub os: HostOs,
    /// Interpreters tried in order; bare names are resolved through PATH
    pub runtime_candidates: &'static [&'static str],
    /// "Locate executable" utility (`which` / `where`)
    pub locate_utility: &'static str,
    /// Standalone package-manager executables
    pub package_managers: &'static [&'static str],
    /// Runtime locations relative to a package-manager prefix, `/`-separated
    pub derived_runtime_paths: &'static [&'static str],
    pub extra_bin_dirs: &'static [&'static str],
    pub extra_lib_dirs: &'static [&'static str],
    pub library_path_var: Option<&'static str>,
    pub native_library: Option<NativeLibrary>,
}

static MACOS: PlatformStrategy = PlatformStrategy {
    os: HostOs::MacOs,
    // GUI launches get PATH=/usr/bin:/bin:/usr/sbin:/sbin, so absolute
    // locations of the common installers must be listed explicitly.
    runtime_candidates: &[
        "python3",
        "/opt/homebrew/bin/python3",
        "/usr/local/bin/python3",
        "/Library/Frameworks/Python.framework/Versions/Current/bin/python3",
        "/usr/bin/python3",
        "python",
    ],
    locate_utility: "which",
    package_managers: &["pip3", "pip"],
    derived_runtime_paths: &["bin/python3", "bin/python"],
    extra_bin_dirs: &["/opt/homebrew/bin", "/usr/local/bin"],
    extra_lib_dirs: &["/opt/homebrew/lib", "/usr/local/lib"],
    library_path_var: Some("DYLD_FALLBACK_LIBRARY_PATH"),
    native_library: Some(NativeLibrary {
        name: "cairo",
        search_paths: &[
            "/opt/homebrew/lib/libcairo.2.dylib",
            "/usr/local/lib/libcairo.2.dylib",
            "/opt/homebrew/opt/cairo/lib/libcairo.2.dylib",
        ],
        formula_manager: "brew",
        formula: "cairo",
        affects: "PNG and JPG export",
    }),
};

static LINUX: PlatformStrategy = PlatformStrategy {
    os: HostOs::Linux,
    runtime_candidates: &["python3", "python", "/usr/bin/python3", "/usr/local/bin/python3"],
    locate_utility: "which",
    package_managers: &["pip3", "pip"],
    derived_runtime_paths: &["bin/python3", "bin/python"],
    extra_bin_dirs: &["/usr/local/bin", "/usr/bin"],
    extra_lib_dirs: &[
        "/usr/local/lib",
        "/usr/lib",
        "/usr/lib/x86_64-linux-gnu",
        "/usr/lib/aarch64-linux-gnu",
    ],
    library_path_var: Some("LD_LIBRARY_PATH"),
    native_library: None,
};

static WINDOWS: PlatformStrategy = PlatformStrategy {
    os: HostOs::Windows,
    runtime_candidates: &["python", "py", "python3", "C:\\Windows\\py.exe"],
    locate_utility: "where",
    package_managers: &["pip", "pip3"],
    derived_runtime_paths: &["python.exe", "Scripts/python.exe"],
    extra_bin_dirs: &[],
    extra_lib_dirs: &[],
    library_path_var: None,
    native_library: None,
};

impl PlatformStrategy {
    pub fn path_separator(&self) -> char {
        match self.os {
            HostOs::Windows => ';',
            _ => ':',
        }
    }

    /// Join a `/`-separated relative path onto `base`
    pub fn join_relative(&self, base: &Path, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(base.to_path_buf(), |path, part| path.join(part))
    }

    /// Merge `extra` directories into a search-path style variable
    ///
    /// Existing entries keep their order; extras are appended when missing.
    pub fn merge_search_path(&self, current: Option<&str>, extra: &[&str]) -> String {
        let separator = self.path_separator();
        let mut entries: Vec<String> = current
            .unwrap_or_default()
            .split(separator)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        for dir in extra {
            if !entries.iter().any(|entry| entry == dir) {
                entries.push((*dir).to_string());
            }
        }
        entries.join(&separator.to_string())
    }

    /// Manual install instructions shown when every install strategy failed
    pub fn install_remediation(&self, package_manager: &str, packages: &[String]) -> String {
        let list = packages.join(" ");
        match self.os {
            HostOs::MacOs => format!(
                "Run this in Terminal, then restart Halftone Studio:\n  {package_manager} install --user {list}\n\
                 If pip itself is missing, install Python with Homebrew first:\n  brew install python"
            ),
            HostOs::Linux => format!(
                "Run this in a terminal, then restart Halftone Studio:\n  {package_manager} install --user {list}\n\
                 On Debian/Ubuntu you may first need:\n  sudo apt install python3-pip"
            ),
            HostOs::Windows => format!(
                "Run this in PowerShell, then restart Halftone Studio:\n  {package_manager} install --user {list}"
            ),
        }
    }

    pub fn runtime_remediation(&self) -> &'static str {
        match self.os {
            HostOs::MacOs => {
                "Install Python 3 from https://www.python.org/downloads/ or run `brew install python`."
            }
            HostOs::Linux => {
                "Install Python 3 and pip, e.g. `sudo apt install python3 python3-pip`."
            }
            HostOs::Windows => {
                "Install Python 3 from https://www.python.org/downloads/ and enable \"Add python.exe to PATH\"."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [HostOs; 3] = [HostOs::MacOs, HostOs::Linux, HostOs::Windows];

    #[test]
    fn test_every_os_has_an_absolute_fallback() {
        for os in ALL {
            let strategy = os.strategy();
            assert!(
                strategy
                    .runtime_candidates
                    .iter()
                    .any(|c| c.starts_with('/') || c.contains(":\\")),
                "{:?} needs an absolute runtime candidate",
                os
            );
        }
    }

    #[test]
    fn test_native_step_only_on_macos() {
        assert!(HostOs::MacOs.strategy().native_library.is_some());
        assert!(HostOs::Linux.strategy().native_library.is_none());
        assert!(HostOs::Windows.strategy().native_library.is_none());
    }

    #[test]
    fn test_merge_search_path_keeps_order_and_skips_duplicates() {
        let strategy = HostOs::MacOs.strategy();
        let merged = strategy.merge_search_path(
            Some("/usr/bin:/usr/local/bin"),
            &["/opt/homebrew/bin", "/usr/local/bin"],
        );
        assert_eq!(merged, "/usr/bin:/usr/local/bin:/opt/homebrew/bin");
    }

    #[test]
    fn test_merge_search_path_from_empty() {
        let strategy = HostOs::Linux.strategy();
        assert_eq!(
            strategy.merge_search_path(None, &["/usr/local/lib"]),
            "/usr/local/lib"
        );
    }

    #[test]
    fn test_join_relative() {
        let strategy = HostOs::Windows.strategy();
        let joined = strategy.join_relative(Path::new("prefix"), "Scripts/python.exe");
        assert_eq!(joined, Path::new("prefix").join("Scripts").join("python.exe"));
    }

    #[test]
    fn test_install_remediation_mentions_packages() {
        let packages = vec!["numpy".to_string(), "Pillow".to_string()];
        for os in ALL {
            let text = os.strategy().install_remediation("python3 -m pip", &packages);
            assert!(text.contains("python3 -m pip install --user numpy Pillow"));
        }
    }
}

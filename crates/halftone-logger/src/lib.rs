use colored::Colorize;
use indicatif::ProgressBar;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

static LOG_FILE: Mutex<Option<PathBuf>> = Mutex::new(None);
static VERBOSITY: Mutex<u8> = Mutex::new(0);
static LOG_WORKER: Mutex<bool> = Mutex::new(false);
static SPINNER: Mutex<Option<ProgressBar>> = Mutex::new(None);

const LOG_FILE_NAME: &str = "halftone.log";

/// Get the current verbosity level
fn get_verbosity() -> u8 {
    VERBOSITY.lock().ok().map(|v| *v).unwrap_or(0)
}

/// Get whether worker stderr is echoed to the console
pub fn get_log_worker() -> bool {
    LOG_WORKER.lock().ok().map(|v| *v).unwrap_or(false)
}

/// Set whether worker stderr is echoed to the console
pub fn set_log_worker(enabled: bool) {
    if let Ok(mut v) = LOG_WORKER.lock() {
        *v = enabled;
    }
}

/// Initialize the logger with a verbosity level
/// 0 = warn only, 1 = debug (-v), 2 = trace (-vv)
pub fn init_with_verbosity(verbosity: u8, log_worker: bool) -> Result<(), String> {
    if let Ok(mut v) = VERBOSITY.lock() {
        *v = verbosity;
    }
    set_log_worker(log_worker);

    init(get_log_dir()?)
}

/// Initialize the logger writing into an explicit directory
pub fn init_in_dir(dir: PathBuf, verbosity: u8) -> Result<(), String> {
    if let Ok(mut v) = VERBOSITY.lock() {
        *v = verbosity;
    }
    init(dir)
}

fn init(log_dir: PathBuf) -> Result<(), String> {
    fs::create_dir_all(&log_dir).map_err(|e| format!("Failed to create log directory: {}", e))?;

    let log_file = log_dir.join(LOG_FILE_NAME);

    // Truncate log file on each run (overwrite instead of append)
    if log_file.exists() {
        let _ = fs::remove_file(&log_file);
    }

    let mut log_file_guard = LOG_FILE
        .lock()
        .map_err(|_| "Log file lock poisoned".to_string())?;
    *log_file_guard = Some(log_file);

    Ok(())
}

/// Get the log directory path
///
/// `HALFTONE_LOG_DIR` wins when set, otherwise the platform config directory.
fn get_log_dir() -> Result<PathBuf, String> {
    if let Ok(dir) = std::env::var("HALFTONE_LOG_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    #[cfg(not(target_os = "windows"))]
    let log_dir = dirs::home_dir()
        .ok_or("Could not determine home directory")?
        .join(".config")
        .join("halftone");

    #[cfg(target_os = "windows")]
    let log_dir = dirs::config_dir()
        .ok_or("Could not determine config directory")?
        .join("halftone");

    Ok(log_dir)
}

fn write_to_log(message: &str) {
    write_to_log_with_source(message, "BRIDGE")
}

fn write_to_log_with_source(message: &str, source: &str) {
    if let Ok(log_file_guard) = LOG_FILE.lock() {
        if let Some(ref log_path) = *log_file_guard {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
                let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                let _ = writeln!(file, "[{}] [{}] {}", timestamp, source, message);
            }
        }
    }
}

/// Log an informational message (to console if verbose >= 1, always to file)
pub fn info(message: &str) {
    write_to_log(&format!("INFO {}", message));
    if get_verbosity() >= 1 {
        eprintln!("{}", message);
    }
}

/// Log a debug message (to console if verbose >= 1, always to file)
pub fn debug(message: &str) {
    write_to_log(&format!("DEBUG {}", message));
    if get_verbosity() >= 1 {
        eprintln!("{} {}", "DEBUG:".blue().bold(), message);
    }
}

/// Log a warning message (to both file and console)
pub fn warn(message: &str) {
    write_to_log(&format!("WARN {}", message));
    eprintln!("{} {}", "warning:".yellow().bold(), message);
}

/// Log an error message (to both file and console)
pub fn error(message: &str) {
    write_to_log(&format!("ERROR {}", message));
    eprintln!("{} {}", "Error:".red().bold(), message);
}

/// Log a success message
pub fn success(message: &str) {
    write_to_log(&format!("SUCCESS {}", message));
    let check = "\u{2714}".green().bold();
    eprintln!("{} {}", check, message);
}

/// Log a step message (important user-facing step)
pub fn step(message: &str) {
    if get_verbosity() >= 2 {
        eprintln!("TRACE: {}", message);
    }
    write_to_log(&format!("STEP: {}", message));
}

/// Record one line of worker stderr.
///
/// Always written to the log file under the `WORKER` tag; echoed to the
/// console only when `--log-worker` was given.
pub fn worker(line: &str) {
    write_to_log_with_source(line, "WORKER");
    if get_log_worker() {
        eprintln!("{} {}", "[worker]".dimmed(), line);
    }
}

/// Capture command output and log it
pub fn capture_output(command_name: &str, code: Option<i32>, stdout: &str, stderr: &str) {
    write_to_log(&format!(
        "COMMAND: {} (exit code: {:?})",
        command_name, code
    ));

    if !stdout.is_empty() {
        write_to_log(&format!("  STDOUT:\n{}", stdout));
    }

    if !stderr.is_empty() {
        write_to_log(&format!("  STDERR:\n{}", stderr));
    }
}

/// Get the log file path for display
pub fn get_log_path() -> Option<PathBuf> {
    LOG_FILE.lock().ok().and_then(|guard| guard.clone())
}

/// Start a spinner with the given message (only if not verbose)
pub fn spinner_start(message: &str) {
    write_to_log(&format!("PROGRESS {}", message));

    // Don't show spinner in verbose mode
    if get_verbosity() > 0 {
        eprintln!("{}", message);
        return;
    }

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message(message.to_string());

    if let Ok(mut spinner_guard) = SPINNER.lock() {
        if let Some(previous) = spinner_guard.replace(spinner) {
            previous.finish_and_clear();
        }
    }
}

/// Complete the spinner with a success message
pub fn spinner_success(message: &str) {
    spinner_stop();
    success(message);
}

/// Stop the spinner with an error message
pub fn spinner_error(message: &str) {
    spinner_stop();
    write_to_log(&format!("ERROR {}", message));
    eprintln!("  {} {}", "✗".red().bold(), message);
}

/// Stop the spinner without any message
pub fn spinner_stop() {
    if let Ok(mut spinner_guard) = SPINNER.lock() {
        if let Some(spinner) = spinner_guard.take() {
            spinner.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_receives_tagged_lines() {
        let Ok(dir) = TempDir::new() else {
            return;
        };
        assert!(init_in_dir(dir.path().to_path_buf(), 0).is_ok());

        debug("probe started");
        worker("Traceback (most recent call last):");
        capture_output("python3 --version", Some(0), "Python 3.12.1\n", "");

        let Some(path) = get_log_path() else {
            panic!("log path should be set after init");
        };
        let contents = fs::read_to_string(path).unwrap_or_default();
        assert!(contents.contains("[BRIDGE] DEBUG probe started"));
        assert!(contents.contains("[WORKER] Traceback"));
        assert!(contents.contains("COMMAND: python3 --version (exit code: Some(0))"));
    }

    #[test]
    fn test_log_worker_flag_round_trips() {
        set_log_worker(true);
        assert!(get_log_worker());
        set_log_worker(false);
        assert!(!get_log_worker());
    }
}

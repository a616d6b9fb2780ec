//! External command execution
//!
//! Discovery and provisioning never spawn processes directly; they go through
//! [`CommandRunner`] so every call has an explicit timeout and tests can
//! script the host.

use crate::errors::{BridgeError, Result};
use crate::platform::PlatformStrategy;
use async_trait::async_trait;
use halftone_logger as logger;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// One external command with its time bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering used in logs
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, for banner and diagnostic matching
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is an `Ok` output; failing to
    /// spawn or exceeding the timeout is an error.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    env: Vec<(String, String)>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment overlay applied to every command
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let display = invocation.display();
        logger::debug(&format!("Running: {}", display));

        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let output = match tokio::time::timeout(invocation.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BridgeError::Exec {
                    program: invocation.program.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                logger::debug(&format!("Timed out after {:?}: {}", invocation.timeout, display));
                return Err(BridgeError::Timeout {
                    command: display,
                    after: invocation.timeout,
                });
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        logger::capture_output(&display, result.code, &result.stdout, &result.stderr);
        Ok(result)
    }
}

/// Find `name` on the search path with the platform's locate utility
///
/// `where` on Windows prints every match; only the first line is used.
pub async fn locate_executable(
    runner: &dyn CommandRunner,
    strategy: &PlatformStrategy,
    name: &str,
    timeout: Duration,
) -> Option<PathBuf> {
    let invocation = Invocation::new(strategy.locate_utility, timeout).arg(name);
    match runner.run(&invocation).await {
        Ok(output) if output.success() => first_line(&output.stdout).map(PathBuf::from),
        Ok(_) => None,
        Err(e) => {
            logger::debug(&format!("Could not locate {}: {}", name, e));
            None
        }
    }
}

pub(crate) fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

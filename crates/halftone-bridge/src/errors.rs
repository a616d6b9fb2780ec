use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the worker bridge
///
/// Startup-phase kinds (`RuntimeNotFound`, `DependencyInstallFailed`) are
/// fatal to the host; everything else is reported to the caller of a single
/// operation and leaves the bridge usable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("No usable Python runtime found: {0}")]
    RuntimeNotFound(String),

    #[error("Failed to install required packages ({}):\n{remedy}", .packages.join(", "))]
    DependencyInstallFailed {
        packages: Vec<String>,
        remedy: String,
    },

    #[error("Native library '{0}' is not available")]
    NativeLibraryMissing(String),

    #[error("Worker sent invalid JSON ({reason}): {excerpt}")]
    ProtocolParse { excerpt: String, reason: String },

    #[error("Worker exited: {0}")]
    WorkerExited(String),

    #[error("{0}")]
    Command(String),

    #[error("'{command}' did not complete within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Failed to start worker '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Failed to run '{program}': {reason}")]
    Exec { program: String, reason: String },

    #[error("Unexpected worker response: {0}")]
    UnexpectedResponse(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl BridgeError {
    /// True for failures that must abort application startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::RuntimeNotFound(_) | BridgeError::DependencyInstallFailed { .. }
        )
    }

    /// Short, stable name of the error kind for logs and dialogs
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::RuntimeNotFound(_) => "RuntimeNotFound",
            BridgeError::DependencyInstallFailed { .. } => "DependencyInstallFailed",
            BridgeError::NativeLibraryMissing(_) => "NativeLibraryMissing",
            BridgeError::ProtocolParse { .. } => "ProtocolParseError",
            BridgeError::WorkerExited(_) => "WorkerExited",
            BridgeError::Command(_) => "CommandError",
            BridgeError::Timeout { .. } => "Timeout",
            BridgeError::Spawn { .. } => "Spawn",
            BridgeError::Exec { .. } => "Exec",
            BridgeError::UnexpectedResponse(_) => "UnexpectedResponse",
            BridgeError::Io(_) => "Io",
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::UnexpectedResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

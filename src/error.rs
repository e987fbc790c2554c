use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WifiError {
    #[error("'{program}' did not finish within {timeout:?}")]
    ExecutionTimeout { program: String, timeout: Duration },

    #[error("Executable '{0}' not found")]
    ExecutableNotFound(String),

    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Password required for secured network '{0}'")]
    SecretRequired(String),

    #[error("Authentication failed for '{0}'")]
    AuthFailure(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Skipped unparsable {what} row: {line}")]
    ParseWarning { what: &'static str, line: String },

    #[error("Failed to write {}: {source}", path.display())]
    StorageWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {}: {reason}", path.display())]
    StorageReadFailure { path: PathBuf, reason: String },

    #[error("No network control backend is available")]
    BackendUnavailable,

    #[error("No WiFi interface found")]
    NoWifiInterface,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend command failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, WifiError>;

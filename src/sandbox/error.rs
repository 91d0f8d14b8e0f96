//! Error taxonomy of the execution engine.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The identifier would resolve outside the approved root.
    #[error("Executable must be inside the approved directory {root}: {reason}")]
    PathTraversal { root: PathBuf, reason: String },

    /// Missing, not a regular file, or not executable.
    #[error("Executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },

    /// A caller-supplied value failed validation before anything was spawned.
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The operating system refused to create the process.
    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit (where the profile treats it as fatal) or timeout.
    #[error("{}", tool_failed_message(.exit_code, .timed_out))]
    ToolFailed {
        exit_code: i32,
        timed_out: bool,
        stdout: String,
        stderr: String,
    },

    /// JSON was required on stdout and stdout is not a single JSON document.
    #[error("Tool stdout must be valid JSON: {reason}")]
    InvalidJsonOutput {
        reason: String,
        exit_code: i32,
        timed_out: bool,
        stdout: String,
        stderr: String,
    },

    /// Waiting on or reading from an already spawned child failed.
    #[error("I/O error while supervising child process: {0}")]
    Io(#[from] std::io::Error),
}

fn tool_failed_message(exit_code: &i32, timed_out: &bool) -> String {
    if *timed_out {
        "Tool execution timed out".to_string()
    } else {
        format!("Tool execution failed with exit code {exit_code}")
    }
}

impl ExecError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

//! Error type shared by every layer below the task executor.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while talking to git-tfs, the TFS server or the local repository.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A required argument was missing or malformed. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An external command exited with a non-zero status.
    #[error("Cannot execute '{command}'")]
    CommandFailed {
        /// Rendered command line, as it was logged.
        command: String,
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
    },

    /// The operation observed its cancellation token.
    #[error("operation canceled")]
    Canceled,

    /// Every attempt to recreate the workspace mapping failed.
    #[error(
        "TFS mapping '{server_folder}' -> '{}' cannot be restored after {attempts} attempts! \
         Please restore it manually (Visual Studio - Team Explorer - Workspaces - Manage Workspaces)",
        local_directory.display()
    )]
    MappingNotRestored {
        server_folder: String,
        local_directory: PathBuf,
        attempts: u32,
        last_error: String,
    },

    /// git-tfs clone did not leave exactly one directory behind.
    #[error("expected git-tfs to create exactly one directory in {}, found {found}", path.display())]
    CloneLayout { path: PathBuf, found: usize },

    #[error("TFS error: {0}")]
    Server(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl BridgeError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Canceled
        } else {
            Self::Join(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

//! Error types for each subsystem.

use thiserror::Error;

/// Errors reported by the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Another request created a sandbox with the same name first.
    #[error("sandbox name already in use: {0}")]
    NameConflict(String),

    #[error("no such sandbox: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Api(String),
}

/// Errors from the persisted session directory.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while ensuring a sandbox exists and is running.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no free port in {start}..{end}")]
    PortsExhausted { start: u16, end: u32 },

    #[error("sandbox {name} could not be restarted after {attempts} recreate attempts")]
    RecreateExhausted { name: String, attempts: u32 },

    #[error("sandbox {0} has no host port bound to its shell service")]
    MissingPort(String),
}

impl SandboxError {
    /// A concurrent creation of the same sandbox; callers should retry.
    pub fn is_creation_race(&self) -> bool {
        matches!(self, SandboxError::Runtime(RuntimeError::NameConflict(_)))
    }
}

/// Errors talking to the shell service inside a sandbox.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connection refused on port {0}")]
    ConnectionRefused(u16),

    #[error("authentication rejected for {0}")]
    AuthRejected(String),

    #[error("timed out connecting to port {0}")]
    Timeout(u16),

    #[error("failed to load private key: {0}")]
    Key(String),

    #[error("remote protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from pushing or moving files inside a sandbox.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no session recorded for user {0}")]
    NoSession(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("file transfer failed after {attempts} attempt(s): {source}")]
    Remote {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("{action} failed: {stderr}")]
    Command { action: &'static str, stderr: String },
}

/// Errors that prevent an evaluation from running at all.
///
/// Failures of the evaluated program itself are reported in the result, not here.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("invalid evaluation script name: {0}")]
    InvalidScript(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no session recorded for user {0}")]
    NoSession(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

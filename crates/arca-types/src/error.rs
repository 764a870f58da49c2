use std::fmt;

use thiserror::Error;

use crate::handle::Handle;

pub type Result<T> = std::result::Result<T, ArcaError>;

/// Details about a lock that blocked an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    /// Name of the conflicting lock object.
    pub name: String,
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    /// Creation time in RFC 3339.
    pub time: String,
}

impl fmt::Display for LockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.exclusive { "exclusive" } else { "shared" };
        let short = self.name.get(..10).unwrap_or(&self.name);
        write!(
            f,
            "{kind} lock {short} held by PID {} on {} by {}, created {}",
            self.pid, self.hostname, self.username, self.time
        )
    }
}

#[derive(Debug, Error)]
pub enum ArcaError {
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("invalid offset {offset} for {handle} ({reason})")]
    InvalidOffset {
        handle: Handle,
        offset: i64,
        reason: String,
    },

    #[error("object not found: {0}")]
    NotFound(Handle),

    #[error("object already exists: {0}")]
    AlreadyExists(Handle),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("repository is already locked: {0}")]
    Locked(LockConflict),

    #[error("lock {0} was already released")]
    AlreadyUnlocked(String),

    #[error("content hash mismatch for {handle}: computed {actual}")]
    HashMismatch { handle: Handle, actual: String },

    #[error("backend operation not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ArcaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArcaError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ArcaError::AlreadyExists(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, ArcaError::Locked(_))
    }
}

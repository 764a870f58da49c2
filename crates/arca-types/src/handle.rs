use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ArcaError, Result};
use crate::id::Id;

/// Category of a stored object. The set is closed: every backend matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Data,
    Snapshot,
    Index,
    Lock,
    Key,
    Config,
}

impl FileType {
    /// All object categories, in layout order.
    pub const ALL: [FileType; 6] = [
        FileType::Data,
        FileType::Snapshot,
        FileType::Index,
        FileType::Lock,
        FileType::Key,
        FileType::Config,
    ];

    /// Directory holding objects of this type, relative to the repository root.
    /// `Config` lives at the root and has none.
    pub fn dir_name(self) -> Option<&'static str> {
        match self {
            FileType::Data => Some("data"),
            FileType::Snapshot => Some("snapshots"),
            FileType::Index => Some("index"),
            FileType::Lock => Some("locks"),
            FileType::Key => Some("keys"),
            FileType::Config => None,
        }
    }

    /// Whether objects of this type are named by the hash of their content.
    pub fn is_content_addressed(self) -> bool {
        matches!(
            self,
            FileType::Data | FileType::Snapshot | FileType::Index | FileType::Lock
        )
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Data => "data",
            FileType::Snapshot => "snapshot",
            FileType::Index => "index",
            FileType::Lock => "lock",
            FileType::Key => "key",
            FileType::Config => "config",
        };
        f.write_str(s)
    }
}

/// Identifies one stored object: its type plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    /// The repository's single config object. Its name is fixed and ignored.
    pub fn config() -> Self {
        Self::new(FileType::Config, "")
    }

    pub fn from_id(file_type: FileType, id: &Id) -> Self {
        Self::new(file_type, id.to_hex())
    }

    /// Check the handle before any storage is touched.
    ///
    /// Names must be non-empty ASCII alphanumerics, which rules out path
    /// separators and traversal. Data names need at least two characters for
    /// the shard directory. Config names are not inspected.
    pub fn validate(&self) -> Result<()> {
        if self.file_type == FileType::Config {
            return Ok(());
        }
        if self.name.is_empty() {
            return Err(ArcaError::InvalidHandle(format!(
                "{}: name is empty",
                self.file_type
            )));
        }
        if !self.name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ArcaError::InvalidHandle(format!(
                "{}: name '{}' contains invalid characters",
                self.file_type, self.name
            )));
        }
        if self.file_type == FileType::Data && self.name.len() < 2 {
            return Err(ArcaError::InvalidHandle(format!(
                "data: name '{}' is shorter than the shard prefix",
                self.name
            )));
        }
        Ok(())
    }

    /// Two-character shard directory for data objects.
    pub fn shard_prefix(&self) -> Option<&str> {
        match self.file_type {
            FileType::Data => self.name.get(..2),
            _ => None,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.file_type {
            FileType::Config => write!(f, "<config>"),
            _ => {
                let short = self.name.get(..10).unwrap_or(&self.name);
                write!(f, "<{}/{}>", self.file_type, short)
            }
        }
    }
}

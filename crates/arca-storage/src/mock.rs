use std::io::Read;

use crossbeam_channel::Receiver;
use tracing::warn;

use arca_types::error::{ArcaError, Result};
use arca_types::{CancelToken, FileType, Handle};

use crate::{Backend, FileInfo};

pub type LocationFn = Box<dyn Fn() -> String + Send + Sync>;
pub type SaveFn = Box<dyn Fn(&Handle, &[u8]) -> Result<()> + Send + Sync>;
pub type LoadFn = Box<dyn Fn(&Handle, u64, i64) -> Result<Box<dyn Read + Send>> + Send + Sync>;
pub type StatFn = Box<dyn Fn(&Handle) -> Result<FileInfo> + Send + Sync>;
pub type TestFn = Box<dyn Fn(&Handle) -> Result<bool> + Send + Sync>;
pub type RemoveFn = Box<dyn Fn(&Handle) -> Result<()> + Send + Sync>;
pub type ListFn = Box<dyn Fn(FileType, &CancelToken) -> Receiver<String> + Send + Sync>;
pub type UnitFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Backend whose every method is supplied by the caller.
///
/// Unset methods fail with [`ArcaError::NotImplemented`]; an unset `list`
/// yields an empty, already-closed channel.
#[derive(Default)]
pub struct MockBackend {
    pub location_fn: Option<LocationFn>,
    pub save_fn: Option<SaveFn>,
    pub load_fn: Option<LoadFn>,
    pub stat_fn: Option<StatFn>,
    pub test_fn: Option<TestFn>,
    pub remove_fn: Option<RemoveFn>,
    pub list_fn: Option<ListFn>,
    pub delete_fn: Option<UnitFn>,
    pub close_fn: Option<UnitFn>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MockBackend {
    fn location(&self) -> String {
        match &self.location_fn {
            Some(f) => f(),
            None => "mock".to_string(),
        }
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        match &self.save_fn {
            Some(f) => f(handle, data),
            None => Err(ArcaError::NotImplemented("save")),
        }
    }

    fn load(&self, handle: &Handle, length: u64, offset: i64) -> Result<Box<dyn Read + Send>> {
        match &self.load_fn {
            Some(f) => f(handle, length, offset),
            None => Err(ArcaError::NotImplemented("load")),
        }
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        match &self.stat_fn {
            Some(f) => f(handle),
            None => Err(ArcaError::NotImplemented("stat")),
        }
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        match &self.test_fn {
            Some(f) => f(handle),
            None => Err(ArcaError::NotImplemented("test")),
        }
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        match &self.remove_fn {
            Some(f) => f(handle),
            None => Err(ArcaError::NotImplemented("remove")),
        }
    }

    fn list(&self, file_type: FileType, cancel: &CancelToken) -> Receiver<String> {
        match &self.list_fn {
            Some(f) => f(file_type, cancel),
            None => {
                warn!(%file_type, "mock backend has no list function");
                let (_tx, rx) = crossbeam_channel::bounded(0);
                rx
            }
        }
    }

    fn delete(&self) -> Result<()> {
        match &self.delete_fn {
            Some(f) => f(),
            None => Err(ArcaError::NotImplemented("delete")),
        }
    }

    fn close(&self) -> Result<()> {
        match &self.close_fn {
            Some(f) => f(),
            None => Err(ArcaError::NotImplemented("close")),
        }
    }
}

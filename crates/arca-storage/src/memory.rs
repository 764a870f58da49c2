use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use arca_types::error::{ArcaError, Result};
use arca_types::{CancelToken, FileType, Handle};

use crate::{send_name, spawn_lister, Backend, FileInfo, CONFIG_NAME};

/// In-memory object store. Thread-safe via a single mutex.
///
/// Clones share the same objects, so a clone can be handed to another
/// component while the test keeps one for inspection.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<Handle, Vec<u8>>,
}

/// Config objects are keyed without their (ignored) name.
fn key_for(handle: &Handle) -> Handle {
    match handle.file_type {
        FileType::Config => Handle::config(),
        _ => handle.clone(),
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all types.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        handle.validate()?;
        let mut state = self.state.lock().unwrap();
        let key = key_for(handle);
        if state.objects.contains_key(&key) {
            return Err(ArcaError::AlreadyExists(handle.clone()));
        }
        state.objects.insert(key, data.to_vec());
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u64, offset: i64) -> Result<Box<dyn Read + Send>> {
        handle.validate()?;
        if offset < 0 {
            return Err(ArcaError::InvalidOffset {
                handle: handle.clone(),
                offset,
                reason: "negative".into(),
            });
        }
        let state = self.state.lock().unwrap();
        let data = state
            .objects
            .get(&key_for(handle))
            .ok_or_else(|| ArcaError::NotFound(handle.clone()))?;
        let start = offset as usize;
        if start > data.len() {
            return Err(ArcaError::InvalidOffset {
                handle: handle.clone(),
                offset,
                reason: format!("past end of object of {} bytes", data.len()),
            });
        }
        let end = match usize::try_from(length) {
            Ok(0) => data.len(),
            Ok(n) => start.saturating_add(n).min(data.len()),
            Err(_) => data.len(),
        };
        Ok(Box::new(Cursor::new(data[start..end].to_vec())))
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.validate()?;
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key_for(handle))
            .map(|data| FileInfo {
                size: data.len() as u64,
            })
            .ok_or_else(|| ArcaError::NotFound(handle.clone()))
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        handle.validate()?;
        let state = self.state.lock().unwrap();
        Ok(state.objects.contains_key(&key_for(handle)))
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        handle.validate()?;
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .remove(&key_for(handle))
            .map(|_| ())
            .ok_or_else(|| ArcaError::NotFound(handle.clone()))
    }

    fn list(&self, file_type: FileType, cancel: &CancelToken) -> Receiver<String> {
        // Snapshot names under the lock; the producer never holds it.
        let names: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .objects
                .keys()
                .filter(|h| h.file_type == file_type)
                .map(|h| match file_type {
                    FileType::Config => CONFIG_NAME.to_string(),
                    _ => h.name.clone(),
                })
                .collect()
        };
        let cancel = cancel.clone();
        spawn_lister(file_type, move |tx| {
            for name in names {
                if !send_name(tx, &cancel, name) {
                    return;
                }
            }
        })
    }

    fn delete(&self) -> Result<()> {
        self.state.lock().unwrap().objects.clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;

use arca_storage::{Backend, MemoryBackend, MockBackend};
use arca_types::error::ArcaError;
use arca_types::{CancelToken, FileType, Handle, Id};

use crate::config::LockConfig;
use crate::lock::LockInfo;
use crate::platform;

/// Above any Linux pid_max, so never a running process.
pub const DEAD_PID: u32 = 99_999_999;

pub const OTHER_HOST: &str = "some-other-host";

/// Lock payload for an arbitrary owner, created `age_secs` ago.
pub fn lock_info(hostname: &str, pid: u32, age_secs: i64, exclusive: bool) -> LockInfo {
    LockInfo {
        time: Utc::now() - chrono::Duration::seconds(age_secs),
        exclusive,
        hostname: hostname.to_string(),
        username: "tester".to_string(),
        pid,
        uid: 1000,
        gid: 1000,
    }
}

/// Lock held by this process on this host.
pub fn own_lock_info(exclusive: bool) -> LockInfo {
    lock_info(&platform::hostname(), std::process::id(), 0, exclusive)
}

/// Store a lock object directly, bypassing the acquire protocol, and
/// return its name.
pub fn plant_lock(storage: &dyn Backend, info: &LockInfo) -> String {
    let data = serde_json::to_vec(info).unwrap();
    let id = Id::hash(&data);
    storage
        .save(&Handle::from_id(FileType::Lock, &id), &data)
        .unwrap();
    id.to_hex()
}

pub fn lock_names(storage: &dyn Backend) -> Vec<String> {
    let mut names = arca_storage::list_all(storage, FileType::Lock);
    names.sort();
    names
}

/// Defaults with a refresh interval short enough to observe in a test.
pub fn fast_refresh_config() -> LockConfig {
    LockConfig {
        stale_after_secs: 3600,
        refresh_interval_secs: 1,
    }
}

/// Memory-backed mock whose `remove` fails while `fail_remove` is set.
pub struct FlakyRemoveBackend {
    pub memory: MemoryBackend,
    pub fail_remove: Arc<AtomicBool>,
    pub remove_calls: Arc<AtomicUsize>,
    pub backend: MockBackend,
}

impl FlakyRemoveBackend {
    pub fn new() -> Self {
        let memory = MemoryBackend::new();
        let fail_remove = Arc::new(AtomicBool::new(false));
        let remove_calls = Arc::new(AtomicUsize::new(0));

        let (save_mem, load_mem, stat_mem, test_mem, remove_mem, list_mem) = (
            memory.clone(),
            memory.clone(),
            memory.clone(),
            memory.clone(),
            memory.clone(),
            memory.clone(),
        );
        let fail = Arc::clone(&fail_remove);
        let calls = Arc::clone(&remove_calls);

        let backend = MockBackend {
            save_fn: Some(Box::new(move |h: &Handle, data: &[u8]| save_mem.save(h, data))),
            load_fn: Some(Box::new(move |h: &Handle, length: u64, offset: i64| {
                load_mem.load(h, length, offset)
            })),
            stat_fn: Some(Box::new(move |h: &Handle| stat_mem.stat(h))),
            test_fn: Some(Box::new(move |h: &Handle| test_mem.test(h))),
            remove_fn: Some(Box::new(move |h: &Handle| {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail.load(Ordering::SeqCst) {
                    return Err(ArcaError::Io(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "simulated remove failure",
                    )));
                }
                remove_mem.remove(h)
            })),
            list_fn: Some(Box::new(move |t: FileType, cancel: &CancelToken| {
                list_mem.list(t, cancel)
            })),
            ..MockBackend::default()
        };

        Self {
            memory,
            fail_remove,
            remove_calls,
            backend,
        }
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

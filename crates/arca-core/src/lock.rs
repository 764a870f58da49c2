use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use arca_storage::{list_all, load_all, Backend};
use arca_types::error::{ArcaError, LockConflict, Result};
use arca_types::{CancelToken, FileType, Handle, Id};

use crate::config::LockConfig;
use crate::platform;

/// Payload of a lock object stored at `locks/<hash of payload>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub time: DateTime<Utc>,
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl LockInfo {
    /// Describe a lock owned by this process, created now.
    pub fn current(exclusive: bool) -> Self {
        Self {
            time: Utc::now(),
            exclusive,
            hostname: platform::hostname(),
            username: platform::username(),
            pid: std::process::id(),
            uid: platform::uid(),
            gid: platform::gid(),
        }
    }

    /// Staleness rule with every input explicit.
    ///
    /// Same-host locks are stale iff their process is gone, whatever their
    /// age. Locks from other hosts cannot be probed, so age alone decides.
    pub fn is_stale_with(
        &self,
        now: DateTime<Utc>,
        local_hostname: &str,
        stale_after: chrono::Duration,
        process_exists: impl Fn(u32) -> bool,
    ) -> bool {
        if self.hostname == local_hostname {
            return !process_exists(self.pid);
        }
        now.signed_duration_since(self.time) > stale_after
    }

    /// Staleness as seen from this host, right now.
    pub fn is_stale(&self, config: &LockConfig) -> bool {
        self.is_stale_with(
            Utc::now(),
            &platform::hostname(),
            config.stale_after(),
            platform::process_exists,
        )
    }

    fn conflict(&self, name: &str) -> LockConflict {
        LockConflict {
            name: name.to_string(),
            exclusive: self.exclusive,
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            pid: self.pid,
            time: self.time.to_rfc3339(),
        }
    }
}

/// Handle to a lock held by this process.
///
/// Releasing is explicit: a token that is dropped while held leaves its
/// object behind until it ages into staleness.
#[derive(Debug)]
pub struct RepoLock {
    info: LockInfo,
    /// Name of the current lock object; `None` once unlocked.
    name: Option<String>,
    last_name: String,
    /// Superseded objects whose removal failed; retried on refresh and unlock.
    leftovers: Vec<String>,
}

impl RepoLock {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn is_exclusive(&self) -> bool {
        self.info.exclusive
    }

    /// Name of the backing lock object while held.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Replace the lock object with one carrying a fresh timestamp.
    ///
    /// The new object is saved before the old one is removed, so the lock
    /// never disappears from the repository in between. Once the new object
    /// is stored the token follows it; a predecessor that cannot be removed
    /// is remembered and removed again on the next refresh or on unlock.
    pub fn refresh(&mut self, storage: &dyn Backend) -> Result<()> {
        let Some(old) = self.name.clone() else {
            return Err(ArcaError::AlreadyUnlocked(self.last_name.clone()));
        };
        let mut info = self.info.clone();
        info.time = Utc::now();
        let new_name = save_lock(storage, &info)?;
        debug!(old = %old, new = %new_name, "refreshed lock");
        self.info = info;
        self.last_name = new_name.clone();
        self.name = Some(new_name.clone());
        if new_name != old {
            self.leftovers.push(old);
        }
        self.remove_leftovers(storage)
    }

    /// Remove the lock object. Unlocking twice is an error.
    pub fn unlock(&mut self, storage: &dyn Backend) -> Result<()> {
        let Some(name) = self.name.take() else {
            return Err(ArcaError::AlreadyUnlocked(self.last_name.clone()));
        };
        match storage.remove(&Handle::new(FileType::Lock, &name)) {
            Ok(()) => {
                debug!(lock = %name, "released lock");
                self.remove_leftovers(storage)
            }
            // Someone else reclaimed it; the token is spent either way.
            Err(e) if e.is_not_found() => {
                if let Err(leftover) = self.remove_leftovers(storage) {
                    warn!(error = %leftover, "failed to remove superseded lock object");
                }
                Err(e)
            }
            Err(e) => {
                self.name = Some(name);
                Err(e)
            }
        }
    }

    /// Retry removal of superseded objects, keeping those that still fail.
    fn remove_leftovers(&mut self, storage: &dyn Backend) -> Result<()> {
        let mut first_err = None;
        self.leftovers.retain(|name| {
            match storage.remove(&Handle::new(FileType::Lock, name)) {
                Ok(()) => false,
                Err(e) if e.is_not_found() => {
                    warn!(lock = %name, "previous lock object was already removed");
                    false
                }
                Err(e) => {
                    warn!(lock = %name, error = %e, "failed to remove previous lock object");
                    first_err.get_or_insert(e);
                    true
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn save_lock(storage: &dyn Backend, info: &LockInfo) -> Result<String> {
    let data = serde_json::to_vec(info)?;
    let id = Id::hash(&data);
    match storage.save(&Handle::from_id(FileType::Lock, &id), &data) {
        Ok(()) => Ok(id.to_hex()),
        // Identical payload means the same lock is already in place.
        Err(e) if e.is_already_exists() => Ok(id.to_hex()),
        Err(e) => Err(e),
    }
}

/// Load and parse one lock object.
pub fn load_lock(storage: &dyn Backend, name: &str) -> Result<LockInfo> {
    let data = load_all(storage, &Handle::new(FileType::Lock, name))?;
    Ok(serde_json::from_slice(&data)?)
}

/// All readable lock objects as `(name, info)` pairs.
///
/// Locks that vanish between listing and loading are skipped, as are
/// objects that do not parse.
pub fn list_locks(storage: &dyn Backend) -> Result<Vec<(String, LockInfo)>> {
    let mut locks = Vec::new();
    for name in list_all(storage, FileType::Lock) {
        match load_lock(storage, &name) {
            Ok(info) => locks.push((name, info)),
            Err(e) if e.is_not_found() => {
                debug!(lock = %name, "lock disappeared while scanning");
            }
            Err(ArcaError::Serialization(e)) => {
                warn!(lock = %name, error = %e, "skipping unreadable lock object");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(locks)
}

fn acquire(storage: &dyn Backend, config: &LockConfig, exclusive: bool) -> Result<RepoLock> {
    let hostname = platform::hostname();
    let now = Utc::now();
    let stale_after = config.stale_after();

    // Scan-then-write: two processes can both pass this check before either
    // writes. Backends offer no compare-and-create to close the window.
    for (name, info) in list_locks(storage)? {
        if info.is_stale_with(now, &hostname, stale_after, platform::process_exists) {
            debug!(lock = %name, host = %info.hostname, pid = info.pid, "ignoring stale lock");
            continue;
        }
        if exclusive || info.exclusive {
            return Err(ArcaError::Locked(info.conflict(&name)));
        }
    }

    let info = LockInfo::current(exclusive);
    let name = save_lock(storage, &info)?;
    debug!(lock = %name, exclusive, "acquired lock");
    Ok(RepoLock {
        info,
        last_name: name.clone(),
        name: Some(name),
        leftovers: Vec::new(),
    })
}

/// Acquire a shared lock. Conflicts only with live exclusive locks.
pub fn new_lock(storage: &dyn Backend, config: &LockConfig) -> Result<RepoLock> {
    acquire(storage, config, false)
}

/// Acquire an exclusive lock. Conflicts with every live lock.
pub fn new_exclusive_lock(storage: &dyn Backend, config: &LockConfig) -> Result<RepoLock> {
    acquire(storage, config, true)
}

/// Remove every lock classified as stale. Returns the number removed.
pub fn remove_stale_locks(storage: &dyn Backend, config: &LockConfig) -> Result<usize> {
    let hostname = platform::hostname();
    let now = Utc::now();
    let mut removed = 0;
    for (name, info) in list_locks(storage)? {
        if !info.is_stale_with(now, &hostname, config.stale_after(), platform::process_exists) {
            continue;
        }
        match storage.remove(&Handle::new(FileType::Lock, &name)) {
            Ok(()) => {
                debug!(lock = %name, host = %info.hostname, pid = info.pid, "removed stale lock");
                removed += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Remove every lock object regardless of owner or age and return the count.
///
/// Live holders are not notified. A later refresh writes a new object and a
/// later unlock reports `NotFound`.
pub fn remove_all_locks(storage: &dyn Backend) -> Result<usize> {
    let mut removed = 0;
    for name in list_all(storage, FileType::Lock) {
        match storage.remove(&Handle::new(FileType::Lock, &name)) {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Acquire a lock with retry and exponential backoff + jitter.
/// Only `Locked` is retried; other errors return immediately.
pub fn acquire_lock_with_retry(
    storage: &dyn Backend,
    config: &LockConfig,
    exclusive: bool,
    max_attempts: usize,
    base_delay_ms: u64,
) -> Result<RepoLock> {
    let mut attempt = 0;
    loop {
        match acquire(storage, config, exclusive) {
            Ok(lock) => return Ok(lock),
            Err(ArcaError::Locked(holder)) if attempt + 1 < max_attempts => {
                let delay = base_delay_ms.saturating_mul(1 << attempt.min(5));
                // Jitter: ±25%
                let spread = (delay / 2).max(1);
                let delay = delay - delay / 4 + rand::random::<u64>() % spread;
                attempt += 1;
                debug!(
                    attempt,
                    max_attempts,
                    holder = %holder,
                    delay_ms = delay,
                    "lock contention, retrying"
                );
                std::thread::sleep(Duration::from_millis(delay));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Cancels the token when dropped, including on unwind.
struct CancelOnDrop<'a>(&'a CancelToken);

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn refresh_until_stopped(
    storage: &dyn Backend,
    lock: &Mutex<RepoLock>,
    stop: &CancelToken,
    interval: Duration,
) {
    loop {
        crossbeam_channel::select! {
            recv(stop.receiver()) -> _ => return,
            default(interval) => {
                let mut lock = lock.lock().unwrap();
                if let Err(e) = lock.refresh(storage) {
                    warn!(error = %e, "failed to refresh repository lock");
                }
            }
        }
    }
}

/// Run `action` while holding a repository lock.
///
/// The lock is refreshed in the background for as long as `action` runs and
/// is always released afterwards. If both the action and the release fail,
/// the action's error is returned.
pub fn with_repo_lock<T>(
    storage: &dyn Backend,
    config: &LockConfig,
    exclusive: bool,
    action: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let lock = Mutex::new(acquire(storage, config, exclusive)?);
    let stop = CancelToken::new();
    let interval = config.refresh_interval();

    let result = std::thread::scope(|s| {
        s.spawn(|| refresh_until_stopped(storage, &lock, &stop, interval));
        let _stop = CancelOnDrop(&stop);
        action()
    });

    let mut lock = lock.into_inner().unwrap_or_else(|e| e.into_inner());
    match lock.unlock(storage) {
        Ok(()) => result,
        Err(release_err) => {
            if result.is_err() {
                warn!("failed to release repository lock: {release_err}");
                result
            } else {
                Err(release_err)
            }
        }
    }
}

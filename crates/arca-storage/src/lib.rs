pub mod local;
pub mod memory;
pub mod mock;
pub mod retry;

use std::io::Read;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::warn;

use arca_types::error::{ArcaError, Result};
use arca_types::{CancelToken, FileType, Handle};

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use mock::MockBackend;
pub use retry::RetryBackend;

/// Capacity of the channel between a `list` producer and its consumer.
pub(crate) const LIST_BUFFER: usize = 64;

/// Name reported by `list(FileType::Config)` when the config object exists.
pub const CONFIG_NAME: &str = "config";

/// Metadata returned by [`Backend::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
}

/// Storage contract every object store implements.
///
/// Objects are immutable: `save` never overwrites, and content-addressed
/// names always map to the same bytes. All methods validate the handle
/// before touching storage.
pub trait Backend: Send + Sync {
    /// Human-readable description of where data lives.
    fn location(&self) -> String;

    /// Atomically store `data` under `handle`. Fails with
    /// [`ArcaError::AlreadyExists`] if the object is already present.
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()>;

    /// Open a reader positioned at `offset`. A `length` of 0 reads to the end.
    ///
    /// The reader is released when dropped.
    fn load(&self, handle: &Handle, length: u64, offset: i64) -> Result<Box<dyn Read + Send>>;

    fn stat(&self, handle: &Handle) -> Result<FileInfo>;

    /// Existence check. Absence is `Ok(false)`, never an error.
    fn test(&self, handle: &Handle) -> Result<bool>;

    /// Delete one object. Fails with [`ArcaError::NotFound`] if absent.
    fn remove(&self, handle: &Handle) -> Result<()>;

    /// Lazily enumerate object names of one type, in no particular order.
    ///
    /// The channel closes when the listing completes or `cancel` fires.
    fn list(&self, file_type: FileType, cancel: &CancelToken) -> Receiver<String>;

    /// Destroy all contents of the backend.
    fn delete(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn location(&self) -> String {
        (**self).location()
    }
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        (**self).save(handle, data)
    }
    fn load(&self, handle: &Handle, length: u64, offset: i64) -> Result<Box<dyn Read + Send>> {
        (**self).load(handle, length, offset)
    }
    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        (**self).stat(handle)
    }
    fn test(&self, handle: &Handle) -> Result<bool> {
        (**self).test(handle)
    }
    fn remove(&self, handle: &Handle) -> Result<()> {
        (**self).remove(handle)
    }
    fn list(&self, file_type: FileType, cancel: &CancelToken) -> Receiver<String> {
        (**self).list(file_type, cancel)
    }
    fn delete(&self) -> Result<()> {
        (**self).delete()
    }
    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Read a whole object into memory.
pub fn load_all(backend: &dyn Backend, handle: &Handle) -> Result<Vec<u8>> {
    let mut reader = backend.load(handle, 0, 0)?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Drain a full listing into a vector.
pub fn list_all(backend: &dyn Backend, file_type: FileType) -> Vec<String> {
    let cancel = CancelToken::new();
    backend.list(file_type, &cancel).iter().collect()
}

/// Push one name to a list consumer. Returns `false` when the producer
/// should stop: cancellation fired or the consumer went away.
pub(crate) fn send_name(tx: &Sender<String>, cancel: &CancelToken, name: String) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    crossbeam_channel::select! {
        send(tx, name) -> res => res.is_ok(),
        recv(cancel.receiver()) -> _ => false,
    }
}

/// Run a list producer on its own thread and hand back the consumer end.
///
/// The sender is dropped when `produce` returns, which closes the channel
/// on both normal completion and cancellation.
pub(crate) fn spawn_lister<F>(file_type: FileType, produce: F) -> Receiver<String>
where
    F: FnOnce(&Sender<String>) + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(LIST_BUFFER);
    let spawned = std::thread::Builder::new()
        .name(format!("arca-list-{file_type}"))
        .spawn(move || produce(&tx));
    if let Err(e) = spawned {
        // The closure (and its sender) was dropped, so `rx` is already closed.
        warn!(%file_type, error = %e, "failed to spawn list producer");
    }
    rx
}

/// Retry policy for transient backend faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

/// Everything needed to construct a backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub retry: RetryConfig,
}

enum BackendKind<'a> {
    Memory,
    Local(&'a str),
}

fn parse_url(url: &str) -> Result<BackendKind<'_>> {
    if url == "memory" || url == "memory://" {
        return Ok(BackendKind::Memory);
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(BackendKind::Local(path));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        return Err(ArcaError::UnsupportedBackend(scheme.to_string()));
    }
    for scheme in ["s3:", "sftp:", "rest:", "rclone:"] {
        if url.starts_with(scheme) {
            return Err(ArcaError::UnsupportedBackend(
                scheme.trim_end_matches(':').to_string(),
            ));
        }
    }
    if url.is_empty() {
        return Err(ArcaError::Config("repository url is empty".into()));
    }
    Ok(BackendKind::Local(url))
}

fn wrap_retry(backend: Box<dyn Backend>, cfg: &StorageConfig) -> Box<dyn Backend> {
    if cfg.retry.max_retries > 0 {
        Box::new(RetryBackend::new(backend, cfg.retry.clone()))
    } else {
        backend
    }
}

/// Open an existing repository described by `cfg`.
pub fn open_backend(cfg: &StorageConfig) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match parse_url(&cfg.url)? {
        BackendKind::Memory => Box::new(MemoryBackend::new()),
        BackendKind::Local(path) => Box::new(LocalBackend::open(path)?),
    };
    Ok(wrap_retry(backend, cfg))
}

/// Create a new repository described by `cfg`.
pub fn create_backend(cfg: &StorageConfig) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match parse_url(&cfg.url)? {
        BackendKind::Memory => Box::new(MemoryBackend::new()),
        BackendKind::Local(path) => Box::new(LocalBackend::create(path)?),
    };
    Ok(wrap_retry(backend, cfg))
}

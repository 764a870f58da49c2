use std::cell::Cell;
use std::io::Read;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use arca_types::error::{ArcaError, Result};
use arca_types::{CancelToken, FileType, Handle};

use crate::{Backend, FileInfo, RetryConfig};

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Only raw I/O faults are retried. Validation, not-found and conflict
/// errors are final.
pub fn is_retryable(err: &ArcaError) -> bool {
    match err {
        ArcaError::Io(e) => is_retryable_io(e),
        _ => false,
    }
}

/// Wraps a backend and retries transient faults with exponential backoff
/// plus jitter. `list` and the returned readers are passed through as-is.
pub struct RetryBackend<B> {
    inner: B,
    config: RetryConfig,
}

impl<B: Backend> RetryBackend<B> {
    pub fn new(inner: B, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn retry<T>(&self, op_name: &str, handle: &Handle, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay_ms = self.config.retry_delay_ms;
        let mut attempt = 0;
        loop {
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} {op_name} {handle}: transient error (attempt {attempt}/{}), retrying: {e}",
                        self.inner.location(),
                        self.config.max_retries,
                    );
                    let jitter = rand::random::<u64>() % delay_ms.max(1);
                    std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                    delay_ms = (delay_ms * 2).min(self.config.retry_max_delay_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<B: Backend> Backend for RetryBackend<B> {
    fn location(&self) -> String {
        self.inner.location()
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        let attempts = Cell::new(0u32);
        self.retry("save", handle, || {
            let attempt = attempts.get();
            attempts.set(attempt + 1);
            match self.inner.save(handle, data) {
                // An earlier attempt reported a fault but still landed.
                Err(e) if attempt > 0 && e.is_already_exists() => {
                    debug!(%handle, "object present after retried save");
                    Ok(())
                }
                other => other,
            }
        })
    }

    fn load(&self, handle: &Handle, length: u64, offset: i64) -> Result<Box<dyn Read + Send>> {
        self.retry("load", handle, || self.inner.load(handle, length, offset))
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        self.retry("stat", handle, || self.inner.stat(handle))
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        self.retry("test", handle, || self.inner.test(handle))
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        self.retry("remove", handle, || self.inner.remove(handle))
    }

    fn list(&self, file_type: FileType, cancel: &CancelToken) -> Receiver<String> {
        self.inner.list(file_type, cancel)
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

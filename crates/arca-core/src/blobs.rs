use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use arca_storage::{load_all, Backend};
use arca_types::error::{ArcaError, Result};
use arca_types::{CancelToken, FileType, Handle, Id};

use crate::pool::{Completed, WorkerPool};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Content ids of the input blobs, in input order.
    pub ids: Vec<Id>,
    /// Objects newly written.
    pub saved: usize,
    /// Inputs that were already present, in storage or earlier in the batch.
    pub deduplicated: usize,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub checked: usize,
    pub bytes: u64,
    /// Objects that failed to load or whose content does not match the name.
    pub errors: Vec<(String, ArcaError)>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RemoveReport {
    pub removed: usize,
    pub failed: Vec<(String, ArcaError)>,
}

/// Push `inputs` through a pool of `workers` threads and collect every
/// completed job.
///
/// Bounded channels sit on both sides of the pool, so at most a few jobs per
/// worker are buffered. Firing `cancel` stops the pool and yields
/// [`ArcaError::Cancelled`].
fn run_jobs<I, R, F>(
    inputs: Vec<I>,
    workers: usize,
    cancel: &CancelToken,
    f: F,
) -> Result<Vec<Completed<I, R>>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(&I, &CancelToken) -> Result<R> + Send + Sync + 'static,
{
    let workers = workers.max(1);
    let cap = workers * 2;
    let (job_tx, job_rx) = crossbeam_channel::bounded::<I>(cap);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<Completed<I, R>>(cap);

    let pool = WorkerPool::new(workers, f, job_rx, result_tx)?;
    let pool_cancel = pool.cancel_token().clone();
    let mut completed = Vec::with_capacity(inputs.len());

    std::thread::scope(|s| {
        s.spawn(move || {
            for input in inputs {
                crossbeam_channel::select! {
                    send(job_tx, input) -> res => {
                        if res.is_err() {
                            return;
                        }
                    }
                    recv(pool_cancel.receiver()) -> _ => return,
                }
            }
            // job_tx drops here → workers drain remaining jobs and exit.
        });

        loop {
            crossbeam_channel::select! {
                recv(result_rx) -> msg => match msg {
                    Ok(done) => completed.push(done),
                    Err(_) => break,
                },
                recv(cancel.receiver()) -> _ => {
                    pool.cancel();
                    break;
                }
            }
        }
    });

    pool.wait()?;
    if cancel.is_cancelled() {
        return Err(ArcaError::Cancelled);
    }
    Ok(completed)
}

/// Save each payload under its content hash, in parallel.
///
/// Objects already in storage and repeats within `blobs` are counted as
/// deduplicated. The first hard failure is returned after the pool drains.
pub fn save_blobs(
    storage: Arc<dyn Backend>,
    file_type: FileType,
    blobs: Vec<Vec<u8>>,
    workers: usize,
    cancel: &CancelToken,
) -> Result<SaveReport> {
    let ids: Vec<Id> = blobs.iter().map(|b| Id::hash(b)).collect();
    let mut seen = HashSet::new();
    let mut in_batch_duplicates = 0;
    let mut jobs = Vec::with_capacity(blobs.len());
    for (id, data) in ids.iter().zip(blobs) {
        if seen.insert(*id) {
            jobs.push((*id, data));
        } else {
            in_batch_duplicates += 1;
        }
    }

    let save = move |(id, data): &(Id, Vec<u8>), _cancel: &CancelToken| -> Result<bool> {
        match storage.save(&Handle::from_id(file_type, id), data) {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    };
    let completed = run_jobs(jobs, workers, cancel, save)?;

    let mut report = SaveReport {
        ids,
        saved: 0,
        deduplicated: in_batch_duplicates,
    };
    for done in completed {
        match done.result {
            Ok(true) => report.saved += 1,
            Ok(false) => report.deduplicated += 1,
            Err(e) => return Err(e),
        }
    }
    debug!(
        %file_type,
        saved = report.saved,
        deduplicated = report.deduplicated,
        "saved blobs"
    );
    Ok(report)
}

/// Load every object of `file_type` and verify it.
///
/// Content-addressed objects must hash to their own name; other types only
/// need to be readable.
pub fn check_blobs(
    storage: Arc<dyn Backend>,
    file_type: FileType,
    workers: usize,
    cancel: &CancelToken,
) -> Result<CheckReport> {
    let names: Vec<String> = storage.list(file_type, cancel).iter().collect();
    if cancel.is_cancelled() {
        return Err(ArcaError::Cancelled);
    }

    let verify = move |name: &String, _cancel: &CancelToken| -> Result<u64> {
        let handle = Handle::new(file_type, name.as_str());
        let data = load_all(&*storage, &handle)?;
        if file_type.is_content_addressed() {
            let expected = Id::from_hex(name)
                .map_err(|e| ArcaError::InvalidHandle(format!("{handle}: {e}")))?;
            let actual = Id::hash(&data);
            if actual != expected {
                return Err(ArcaError::HashMismatch {
                    handle,
                    actual: actual.to_hex(),
                });
            }
        }
        Ok(data.len() as u64)
    };
    let completed = run_jobs(names, workers, cancel, verify)?;

    let mut report = CheckReport::default();
    for done in completed {
        report.checked += 1;
        match done.result {
            Ok(size) => report.bytes += size,
            Err(e) => {
                warn!(%file_type, name = %done.input, error = %e, "object failed verification");
                report.errors.push((done.input, e));
            }
        }
    }
    report.errors.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(
        %file_type,
        checked = report.checked,
        errors = report.errors.len(),
        "checked blobs"
    );
    Ok(report)
}

/// Remove the named objects of `file_type` in parallel.
///
/// Per-object failures, including absent objects, are collected rather than
/// aborting the batch.
pub fn remove_blobs(
    storage: Arc<dyn Backend>,
    file_type: FileType,
    names: Vec<String>,
    workers: usize,
    cancel: &CancelToken,
) -> Result<RemoveReport> {
    let remove = move |name: &String, _cancel: &CancelToken| -> Result<()> {
        storage.remove(&Handle::new(file_type, name.as_str()))
    };
    let completed = run_jobs(names, workers, cancel, remove)?;

    let mut report = RemoveReport::default();
    for done in completed {
        match done.result {
            Ok(()) => report.removed += 1,
            Err(e) => report.failed.push((done.input, e)),
        }
    }
    report.failed.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(
        %file_type,
        removed = report.removed,
        failed = report.failed.len(),
        "removed blobs"
    );
    Ok(report)
}

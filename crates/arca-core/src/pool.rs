use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use arca_types::error::{ArcaError, Result};
use arca_types::CancelToken;

/// A job handed back by a worker, tagged with its outcome.
#[derive(Debug)]
pub struct Completed<I, R> {
    pub input: I,
    pub result: Result<R>,
}

/// Fixed set of threads running one job function over a shared input channel.
///
/// Results go to the output channel in completion order. The output channel
/// closes once every worker has exited, since workers own its only senders.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl WorkerPool {
    /// Start `workers` threads that take jobs from `jobs` until it is drained
    /// and closed, or until the pool is cancelled.
    ///
    /// The caller should drop its own clones of `results`; otherwise the
    /// output channel stays open after the pool finishes.
    pub fn new<I, R, F>(
        workers: usize,
        f: F,
        jobs: Receiver<I>,
        results: Sender<Completed<I, R>>,
    ) -> Result<Self>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(&I, &CancelToken) -> Result<R> + Send + Sync + 'static,
    {
        if workers == 0 {
            return Err(ArcaError::Config("worker pool needs at least one worker".into()));
        }
        let cancel = CancelToken::new();
        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(workers);

        for n in 0..workers {
            let f = Arc::clone(&f);
            let jobs = jobs.clone();
            let results = results.clone();
            let worker_cancel = cancel.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("arca-worker-{n}"))
                .spawn(move || run_worker(&*f, &jobs, &results, &worker_cancel));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    cancel.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ArcaError::Io(e));
                }
            }
        }
        debug!(workers, "worker pool started");

        Ok(Self { handles, cancel })
    }

    /// Stop taking new jobs and signal in-flight job functions to return.
    /// Results already delivered stay delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The signal passed to every job function.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block until every worker has exited.
    ///
    /// A worker that panicked is reported once all others have been joined.
    pub fn wait(self) -> Result<()> {
        let mut panicked = 0;
        for handle in self.handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            warn!(panicked, "worker threads panicked");
            return Err(ArcaError::Other(format!(
                "{panicked} worker thread(s) panicked"
            )));
        }
        Ok(())
    }
}

/// One worker: take, process, deliver, repeat. Holds at most one job.
fn run_worker<I, R, F>(
    f: &F,
    jobs: &Receiver<I>,
    results: &Sender<Completed<I, R>>,
    cancel: &CancelToken,
) where
    F: Fn(&I, &CancelToken) -> Result<R>,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let input = crossbeam_channel::select! {
            recv(jobs) -> job => match job {
                Ok(job) => job,
                // Input closed and drained.
                Err(_) => return,
            },
            recv(cancel.receiver()) -> _ => return,
        };

        let result = f(&input, cancel);
        let done = Completed { input, result };

        crossbeam_channel::select! {
            send(results, done) -> res => {
                if res.is_err() {
                    // Consumer gone.
                    return;
                }
            }
            recv(cancel.receiver()) -> _ => return,
        }
    }
}

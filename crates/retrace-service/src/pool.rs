//! The retrace worker pool.
//!
//! Workers unpack the packages of one task at a time and hand the unpacked task to a single
//! consumer, which runs on the calling thread and is the only one touching storage. Unpacked
//! tasks wait in a bounded queue, so at most a few tasks worth of packages sit on disk at once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam::channel;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::RetraceError;
use crate::task::{RetraceTask, TaskState};

/// Outcome counts of the tasks of a [`RetracePool::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub done: usize,
    pub failed: usize,
}

/// Outcome counts of the symbol sources of a retrace run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetraceStats {
    /// Symbol sources resolved to a function.
    pub resolved: usize,
    /// Symbol sources that could not be paired with packages.
    pub skipped: usize,
    /// Symbol sources that failed to resolve.
    pub failed: usize,
}

impl RetraceStats {
    pub fn total(&self) -> usize {
        self.resolved + self.skipped + self.failed
    }

    pub fn add(&mut self, other: RetraceStats) {
        self.resolved += other.resolved;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl fmt::Display for RetraceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} resolved, {} skipped, {} failed",
            self.resolved, self.skipped, self.failed
        )
    }
}

/// A fixed set of threads unpacking retrace tasks.
pub struct RetracePool {
    pool: ThreadPool,
    workers: usize,
    stop: Arc<AtomicBool>,
}

impl fmt::Debug for RetracePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetracePool")
            .field("workers", &self.workers)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl RetracePool {
    pub fn new(workers: usize) -> Result<Self, RetraceError> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("retrace-worker-{i}"))
            .build()?;

        Ok(Self {
            pool,
            workers,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a flag which stops the pool when set.
    ///
    /// Workers check the flag between tasks. A task that is being unpacked is finished first.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Unpacks all `tasks` in the pool and passes each unpacked task to `consume`.
    ///
    /// Tasks failing to unpack are counted and skipped. The directories of a task are removed
    /// once `consume` returns, whatever it returns. A fatal error from unpacking or from
    /// `consume` stops the pool and is returned after all workers are idle.
    pub fn run<F>(
        &self,
        tasks: Vec<RetraceTask>,
        unpacker: &dyn crate::unpack::Unpacker,
        mut consume: F,
    ) -> Result<PoolStats, RetraceError>
    where
        F: FnMut(&mut RetraceTask) -> Result<(), RetraceError>,
    {
        let total = tasks.len();
        let mut stats = PoolStats::default();
        let mut fatal = None;

        let (task_tx, task_rx) = channel::unbounded();
        for task in tasks {
            // the receiver is alive for the whole function
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        self.pool.in_place_scope(|scope| {
            let (out_tx, out_rx) = channel::bounded::<Result<RetraceTask, RetraceError>>(self.workers);

            for _ in 0..self.workers {
                let task_rx = task_rx.clone();
                let out_tx = out_tx.clone();
                let stop = &self.stop;

                scope.spawn(move |_| {
                    while let Ok(mut task) = task_rx.recv() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }

                        tracing::info!(
                            "[{} / {}] Unpacking '{}'",
                            task.id,
                            total,
                            task.nvra()
                        );
                        let start = Instant::now();
                        let result = match task.unpack(unpacker) {
                            Ok(()) => Ok(task),
                            Err(err) => {
                                tracing::warn!("Failed to unpack '{}': {}", task.nvra(), err);
                                Err(err.into())
                            }
                        };
                        metric!(timer("retrace.task.unpack") = start.elapsed());

                        // a closed queue means the consumer gave up, the task is dropped along
                        // with its directories
                        if out_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(out_tx);

            for result in out_rx.iter() {
                let outcome = match result {
                    Ok(mut task) => {
                        task.state = TaskState::Resolving;
                        let outcome = consume(&mut task);
                        task.release();
                        task.state = match outcome {
                            Ok(()) => TaskState::Done,
                            Err(_) => TaskState::Failed,
                        };
                        tracing::debug!("Task {} is {}", task.id, task.state);
                        outcome
                    }
                    Err(err) => Err(err),
                };

                match outcome {
                    Ok(()) => {
                        stats.done += 1;
                        metric!(counter("retrace.tasks") += 1, "status" => "done");
                    }
                    Err(err) => {
                        stats.failed += 1;
                        metric!(counter("retrace.tasks") += 1, "status" => "failed");
                        if err.is_fatal() {
                            tracing::error!("Stopping retrace workers: {}", err);
                            self.stop.store(true, Ordering::Relaxed);
                            fatal = Some(err);
                            break;
                        }
                    }
                }
            }
            drop(out_rx);
        });

        match fatal {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::ThreadPoolBuilder;

use crate::{Error, Partition, Result, Trajectory, TrajectoryID, TrajectoryTable};

// How often the coordinator wakes up to check for cancellation and timeouts
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorConfig {
    /// At least 1
    pub workers: usize,
    /// Budget for each partition, measured from when it starts running
    pub timeout: Option<Duration>,
    /// When cancelling or failing, don't wait for partitions that are already running
    pub force_kill: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout: None,
            force_kill: false,
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Requests that in-flight and future calls on an executor stop.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs a function over every trajectory of a table, in parallel, and merges the results.
///
/// Each call builds its own worker pool; nothing is shared between calls. The result is
/// all-or-nothing: any failing partition, timeout, or cancellation discards every result.
pub struct Executor {
    config: ExecutorConfig,
    cancel: CancelHandle,
}

enum Msg<T> {
    Started(usize, Instant),
    Finished(usize, Result<T>),
    Skipped,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::InvalidConfig {
                op: "Executor::new",
                reason: "workers must be at least 1".to_string(),
            });
        }
        if config.timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig {
                op: "Executor::new",
                reason: "timeout must be positive".to_string(),
            });
        }
        Ok(Self {
            config,
            cancel: CancelHandle::default(),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Once cancelled, an executor stays cancelled.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// `f` sees one trajectory's rows at a time, and must not depend on the order partitions run
    /// in. Results are merged in trajectory ID order, so the output doesn't depend on the number of
    /// workers.
    pub fn map<F>(&self, op: &'static str, table: &TrajectoryTable, f: F) -> Result<TrajectoryTable>
    where
        F: Fn(Partition) -> Result<Partition> + Send + Sync + 'static,
    {
        let rows_before = table.len();
        let outputs = self.run(op, table.partitions(), f)?;
        let result = TrajectoryTable::merge(op, outputs, table.columns())?;
        info!(
            "{op}: {} rows in {} trajectories became {} rows in {} trajectories",
            rows_before,
            table.num_trajectories(),
            result.len(),
            result.num_trajectories()
        );
        Ok(result)
    }

    /// Computes something per trajectory, without producing a new table
    pub fn for_each<T, F>(
        &self,
        op: &'static str,
        table: &TrajectoryTable,
        f: F,
    ) -> Result<BTreeMap<TrajectoryID, T>>
    where
        T: Send + 'static,
        F: Fn(Trajectory) -> Result<T> + Send + Sync + 'static,
    {
        let keys: Vec<TrajectoryID> = table.ids().cloned().collect();
        let outputs = self.run(op, table.partitions(), move |partition: Partition| {
            // Partitions come straight from the table, so they're already valid
            f(Trajectory::unchecked(partition.key(), partition.rows()))
        })?;
        Ok(keys.into_iter().zip(outputs).collect())
    }

    fn run<T, F>(&self, op: &'static str, partitions: Vec<Partition>, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Partition) -> Result<T> + Send + Sync + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled { op });
        }
        let total = partitions.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let keys: Vec<TrajectoryID> = partitions.iter().map(|p| p.key().clone()).collect();

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("trailprep-worker-{i}"))
            .build()
            .map_err(|err| Error::InvalidConfig {
                op,
                reason: err.to_string(),
            })?;
        debug!(
            "{op}: dispatching {total} partitions to {} workers",
            self.config.workers
        );

        let (tx, rx) = mpsc::channel();
        let f = Arc::new(f);
        // Set when this call fails, so unstarted partitions are skipped
        let abort = Arc::new(AtomicBool::new(false));
        for (idx, partition) in partitions.into_iter().enumerate() {
            let tx = tx.clone();
            let f = f.clone();
            let abort = abort.clone();
            let cancel = self.cancel.clone();
            pool.spawn(move || {
                if abort.load(Ordering::SeqCst) || cancel.is_cancelled() {
                    let _ = tx.send(Msg::Skipped);
                    return;
                }
                let _ = tx.send(Msg::Started(idx, Instant::now()));
                let key = partition.key().clone();
                let result = match catch_unwind(AssertUnwindSafe(|| (*f)(partition))) {
                    Ok(result) => result,
                    Err(panic) => Err(Error::Panicked {
                        op,
                        traj_id: key,
                        reason: panic_message(panic),
                    }),
                };
                // The receiver is gone if the call was abandoned
                let _ = tx.send(Msg::Finished(idx, result));
            });
        }
        drop(tx);

        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut running: BTreeMap<usize, Instant> = BTreeMap::new();
        let mut remaining = total;
        let mut failure: Option<Error> = None;
        // A partition past its budget may never return, so never wait on it
        let mut stuck = false;

        while remaining > 0 {
            if failure.is_none() && self.cancel.is_cancelled() {
                warn!("{op}: cancelled with {remaining} partitions outstanding");
                abort.store(true, Ordering::SeqCst);
                failure = Some(Error::Cancelled { op });
            }
            if failure.is_some() && (stuck || self.config.force_kill) {
                break;
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Msg::Started(idx, at)) => {
                    running.insert(idx, at);
                }
                Ok(Msg::Finished(idx, result)) => {
                    let started = running.remove(&idx);
                    remaining -= 1;
                    // Finishing late still counts as a timeout
                    let result = match (started, self.config.timeout) {
                        (Some(at), Some(limit)) if at.elapsed() > limit => Err(Error::Timeout {
                            op,
                            traj_id: keys[idx].clone(),
                            limit,
                        }),
                        _ => result,
                    };
                    match result {
                        Ok(x) => {
                            results[idx] = Some(x);
                        }
                        Err(err) => {
                            if failure.is_none() {
                                warn!("{op}: partition {} failed: {err}", keys[idx]);
                                abort.store(true, Ordering::SeqCst);
                                failure = Some(err);
                            } else {
                                debug!("{op}: partition {} also failed: {err}", keys[idx]);
                            }
                        }
                    }
                }
                Ok(Msg::Skipped) => {
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Every job sends a final message before hanging up
                    if failure.is_none() {
                        failure = Some(Error::Io {
                            op,
                            reason: format!("worker pool stopped with {remaining} partitions left"),
                        });
                    }
                    break;
                }
            }

            if let Some(limit) = self.config.timeout {
                if let Some((idx, _)) = running.iter().find(|(_, at)| at.elapsed() >= limit) {
                    stuck = true;
                    if failure.is_none() {
                        warn!("{op}: partition {} exceeded {limit:?}", keys[*idx]);
                        abort.store(true, Ordering::SeqCst);
                        failure = Some(Error::Timeout {
                            op,
                            traj_id: keys[*idx].clone(),
                            limit,
                        });
                    }
                }
            }
        }

        if let Some(err) = failure {
            if !running.is_empty() {
                debug!(
                    "{op}: abandoning {} running partitions; their results will be dropped",
                    running.len()
                );
            }
            return Err(err);
        }
        results
            .into_iter()
            .zip(keys)
            .map(|(result, key)| {
                result.ok_or_else(|| Error::Io {
                    op,
                    reason: format!("no result for partition {key}"),
                })
            })
            .collect()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic".to_string()
}

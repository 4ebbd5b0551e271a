use crate::aggregate::Aggregate;
use crate::engine::executor::{JobExecutor, ProcessExecutor, ThreadExecutor, WorkerCommand};
use crate::engine::scheduler::{ProgressObserver, Scheduler, TracingObserver};
use crate::engine::worker::WorkerContext;
use crate::errors::RunError;
use crate::model::{JobDescriptor, JobFailure, JobOutcome, ResultTable};
use crate::retry::RetryPolicy;
use crate::scratch::ScratchGuard;
use crate::simulator::Simulator;
use crate::storage::export::{self, IfExists};
use crate::storage::sink::ResultSink;
use crate::storage::view::Axis;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default destination table for [`ParallelRunner::save_to_sqlite`].
pub const DEFAULT_EXPORT_TABLE: &str = "aggregated_tables";

/// Where jobs execute.
#[derive(Clone)]
pub enum Dispatch {
    /// In-process on the blocking pool; the simulator is shared by all workers.
    Threads(Arc<dyn Simulator>),
    /// One child per job via the worker protocol.
    Processes(WorkerCommand),
}

impl Dispatch {
    pub fn is_processes(&self) -> bool {
        matches!(self, Dispatch::Processes(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    ClearingSink,
    Dispatching,
    Ready,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::ClearingSink => "clearing_sink",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Ready => "ready",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker count; negative values count back from the number of CPUs.
    pub workers: i64,
    pub clear_sink: bool,
    /// Abort the batch on the first failed job.
    pub fail_fast: bool,
    /// Do not dispatch job ids that already have rows in the sink.
    pub skip_completed: bool,
    pub retry: RetryPolicy,
    pub aggregate: Option<Aggregate>,
    pub subset: Vec<String>,
    /// Directory under which the per-run `<run-id>_scratch` directory is created.
    pub scratch_root: PathBuf,
    pub window_factor: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            // leave two cores for the rest of the machine
            workers: (total_cpus() - 2).max(1),
            clear_sink: true,
            fail_fast: false,
            skip_completed: false,
            retry: RetryPolicy::default(),
            aggregate: None,
            subset: Vec::new(),
            scratch_root: PathBuf::from("."),
            window_factor: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub submitted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<JobFailure>,
    pub tables: Vec<String>,
    pub elapsed: Duration,
}

/// Orders failures by job id, numerically when both ids are integers.
fn sort_failures(failed: &mut [JobFailure]) {
    failed.sort_by(|a, b| {
        let (x, y) = (a.job_id.as_str(), b.job_id.as_str());
        match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(m), Ok(n)) => m.cmp(&n),
            _ => x.cmp(y),
        }
    });
}

fn total_cpus() -> i64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1)
}

/// Resolves a requested worker count against the machine's CPUs.
pub fn resolve_workers(requested: i64, processes: bool) -> Result<usize, RunError> {
    resolve_workers_for(requested, processes, total_cpus())
}

fn resolve_workers_for(requested: i64, processes: bool, total: i64) -> Result<usize, RunError> {
    let resolved = if requested < 0 {
        total + requested
    } else {
        requested
    };
    if requested == 0 || resolved <= 0 {
        return Err(RunError::InvalidConcurrency(format!(
            "resolved worker count must be positive; got {} (requested {}, cpus {})",
            resolved, requested, total
        )));
    }
    if processes && resolved > total {
        return Err(RunError::InvalidConcurrency(format!(
            "{} worker processes exceed the {} available cpus",
            resolved, total
        )));
    }
    Ok(resolved as usize)
}

/// Runs batches against one result sink and answers questions about the last batch.
///
/// Results are only served once a batch has finished with at least one successful job;
/// asking earlier, or after a pool-level failure, is an error rather than an empty
/// table.
pub struct ParallelRunner {
    sink: ResultSink,
    phase: RunPhase,
    failed: Vec<JobFailure>,
    observer: Arc<dyn ProgressObserver>,
    summary: Option<RunSummary>,
}

impl ParallelRunner {
    pub fn new(sink: ResultSink) -> Self {
        Self {
            sink,
            phase: RunPhase::Idle,
            failed: Vec::new(),
            observer: Arc::new(TracingObserver),
            summary: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// True only after the last batch finished without a pool-level error.
    pub fn ran_ok(&self) -> bool {
        self.phase == RunPhase::Ready
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Jobs of the last batch that failed after exhausting their retries.
    pub fn failed_jobs(&self) -> &[JobFailure] {
        &self.failed
    }

    /// Keeps the jobs whose ids failed in the last batch, for resubmission.
    pub fn retain_failed(&self, jobs: impl IntoIterator<Item = JobDescriptor>) -> Vec<JobDescriptor> {
        let ids: BTreeSet<&str> = self.failed.iter().map(|f| f.job_id.as_str()).collect();
        jobs.into_iter()
            .filter(|j| ids.contains(j.id.as_str()))
            .collect()
    }

    /// Runs every job to completion (or to failure) and records the outcome.
    ///
    /// Individual job failures are collected in [`failed_jobs`](Self::failed_jobs); the
    /// batch itself only fails on invalid concurrency, sink or scratch errors, when
    /// every job failed, or on the first failure with `fail_fast`.
    pub async fn run_all_jobs<I>(
        &mut self,
        jobs: I,
        dispatch: Dispatch,
        options: &RunOptions,
    ) -> Result<RunSummary, RunError>
    where
        I: IntoIterator<Item = JobDescriptor>,
        I::IntoIter: Send + 'static,
    {
        self.phase = RunPhase::Idle;
        self.failed.clear();
        self.summary = None;
        let result = self.run_batch(jobs, dispatch, options).await;
        match &result {
            Ok(summary) => {
                self.phase = RunPhase::Ready;
                self.summary = Some(summary.clone());
                tracing::info!(
                    event = "batch.finished",
                    submitted = summary.submitted,
                    succeeded = summary.succeeded,
                    failed = summary.failed.len(),
                    skipped = summary.skipped,
                    tables = summary.tables.len(),
                    elapsed_ms = summary.elapsed.as_millis() as u64
                );
            }
            Err(e) => {
                self.phase = RunPhase::Failed;
                tracing::error!(event = "batch.failed", error = %e);
            }
        }
        result
    }

    async fn run_batch<I>(
        &mut self,
        jobs: I,
        dispatch: Dispatch,
        options: &RunOptions,
    ) -> Result<RunSummary, RunError>
    where
        I: IntoIterator<Item = JobDescriptor>,
        I::IntoIter: Send + 'static,
    {
        let started = Instant::now();
        let workers = resolve_workers(options.workers, dispatch.is_processes())?;

        if options.clear_sink {
            self.phase = RunPhase::ClearingSink;
            self.sink.clear()?;
        }

        let skipped = Arc::new(AtomicUsize::new(0));
        let done = if options.skip_completed {
            self.sink.completed_jobs()?
        } else {
            BTreeSet::new()
        };
        if !done.is_empty() {
            tracing::info!(event = "batch.skip_completed", completed = done.len());
        }
        let skip_counter = skipped.clone();
        let pending = jobs.into_iter().filter(move |job| {
            let seen = done.contains(job.id.as_str());
            if seen {
                skip_counter.fetch_add(1, Ordering::Relaxed);
            }
            !seen
        });

        let run_id = format!(
            "{}_{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
            std::process::id()
        );
        // dropped on every exit path of this future, cancellation included
        let scratch = ScratchGuard::create(&options.scratch_root, &run_id).map_err(|e| {
            RunError::Scratch {
                path: options.scratch_root.display().to_string(),
                source: e,
            }
        })?;

        let ctx = WorkerContext::new(self.sink.clone(), scratch.run_dir())
            .with_retry(options.retry)
            .with_aggregate(options.aggregate)
            .with_subset(options.subset.clone());
        let executor: Arc<dyn JobExecutor> = match dispatch {
            Dispatch::Threads(simulator) => Arc::new(ThreadExecutor::new(simulator, ctx)),
            Dispatch::Processes(command) => Arc::new(ProcessExecutor::new(command, ctx)),
        };

        self.phase = RunPhase::Dispatching;
        let mut stream = Scheduler::new(workers)
            .window_factor(options.window_factor)
            .observer(self.observer.clone())
            .stream(executor, pending);

        let mut succeeded = 0;
        let mut tables = BTreeSet::new();
        while let Some(completion) = stream.next().await {
            match completion.outcome {
                JobOutcome::Success { tables: written, .. } => {
                    succeeded += 1;
                    tables.extend(written);
                }
                JobOutcome::Failure { job_id, kind, message, .. } => {
                    self.failed.push(JobFailure {
                        job_id: job_id.clone(),
                        kind,
                        message: message.clone(),
                    });
                    if options.fail_fast {
                        // jobs holding a slot still write to the sink and the scratch
                        // directory, so they finish before either is released
                        for straggler in stream.drain_running().await {
                            if let JobOutcome::Failure { job_id, kind, message, .. } = straggler.outcome {
                                self.failed.push(JobFailure { job_id, kind, message });
                            }
                        }
                        drop(stream);
                        sort_failures(&mut self.failed);
                        return Err(RunError::FailFast {
                            job_id: job_id.to_string(),
                            kind,
                            message,
                        });
                    }
                }
            }
        }
        let submitted = stream.progress().submitted;
        drop(stream);

        if submitted > 0 && succeeded == 0 {
            return Err(RunError::AllJobsFailed(submitted));
        }
        sort_failures(&mut self.failed);

        Ok(RunSummary {
            submitted,
            succeeded,
            skipped: skipped.load(Ordering::Relaxed),
            failed: self.failed.clone(),
            tables: tables.into_iter().collect(),
            elapsed: started.elapsed(),
        })
    }

    fn ensure_ready(&self) -> Result<(), RunError> {
        if self.ran_ok() {
            Ok(())
        } else {
            Err(RunError::NotReady(self.phase.as_str().to_string()))
        }
    }

    /// Data tables recorded in the sink, including those from earlier batches that were
    /// not cleared.
    pub fn table_names(&self) -> Result<Vec<String>, RunError> {
        self.ensure_ready()?;
        Ok(self.sink.written_tables()?.into_iter().collect())
    }

    pub fn results(&self, axis: Axis) -> Result<ResultTable, RunError> {
        self.ensure_ready()?;
        Ok(self.sink.consolidated_view(axis)?)
    }

    fn non_empty_results(&self) -> Result<ResultTable, RunError> {
        let view = self.results(Axis::Rows)?;
        if view.is_empty() {
            return Err(RunError::NoResults);
        }
        Ok(view)
    }

    /// Copies the row-wise consolidated view into `table` of another SQLite file.
    pub fn save_to_sqlite(&self, path: &Path, table: &str, if_exists: IfExists) -> Result<usize, RunError> {
        let view = self.non_empty_results()?;
        export::save_to_sqlite(&view, path, table, if_exists)?;
        Ok(view.len())
    }

    pub fn save_to_csv(&self, path: &Path) -> Result<usize, RunError> {
        let view = self.non_empty_results()?;
        export::save_to_csv(&view, path)?;
        Ok(view.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn negative_workers_count_back_from_cpus() {
        assert_eq!(resolve_workers_for(-2, true, 8).unwrap(), 6);
        assert_eq!(resolve_workers_for(3, true, 8).unwrap(), 3);
    }

    #[test]
    fn zero_or_exhausted_workers_are_rejected() {
        assert!(matches!(
            resolve_workers_for(0, false, 8),
            Err(RunError::InvalidConcurrency(_))
        ));
        assert!(resolve_workers_for(-8, false, 8).is_err());
        assert!(resolve_workers_for(-9, true, 8).is_err());
    }

    #[test]
    fn processes_may_not_oversubscribe_but_threads_may() {
        assert!(resolve_workers_for(16, true, 8).is_err());
        assert_eq!(resolve_workers_for(16, false, 8).unwrap(), 16);
    }

    #[test]
    fn fresh_runner_refuses_queries() {
        let runner = ParallelRunner::new(ResultSink::new("/tmp/simbatch-never-run.db"));
        assert!(!runner.ran_ok());
        assert_eq!(runner.phase(), RunPhase::Idle);
        assert!(matches!(runner.table_names(), Err(RunError::NotReady(_))));
        assert!(matches!(runner.results(Axis::Rows), Err(RunError::NotReady(_))));
    }

    #[test]
    fn failures_sort_by_numeric_job_id() {
        let mut failed: Vec<JobFailure> = ["10", "2", "b", "1", "a"]
            .into_iter()
            .map(|id| JobFailure {
                job_id: id.into(),
                kind: ErrorKind::EngineFailed,
                message: String::new(),
            })
            .collect();
        sort_failures(&mut failed);
        let ids: Vec<&str> = failed.iter().map(|f| f.job_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "10", "a", "b"]);
    }

    #[test]
    fn default_options_resolve() {
        let opts = RunOptions::default();
        assert!(resolve_workers(opts.workers, true).is_ok());
        assert!(opts.clear_sink);
    }
}

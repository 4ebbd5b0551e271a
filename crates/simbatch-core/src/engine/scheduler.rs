use crate::engine::executor::JobExecutor;
use crate::errors::ErrorKind;
use crate::model::{JobDescriptor, JobId, JobOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const DEFAULT_WINDOW_FACTOR: usize = 2;

/// One finished job, yielded in completion order.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    /// Time spent holding a worker slot.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
    /// Known when the job source reports an exact length.
    pub total_hint: Option<usize>,
}

impl Progress {
    pub fn in_flight(&self) -> usize {
        self.submitted - self.completed
    }
}

pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, _total_hint: Option<usize>) {}

    fn on_completion(&self, completion: &Completion, progress: &Progress);

    fn on_finish(&self, _progress: &Progress) {}
}

/// Logs every completion through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_completion(&self, completion: &Completion, progress: &Progress) {
        match &completion.outcome {
            JobOutcome::Success { rows, attempts, .. } => tracing::info!(
                event = "job.completed",
                job_id = %completion.job_id,
                rows,
                attempts,
                completed = progress.completed,
                total = ?progress.total_hint
            ),
            JobOutcome::Failure { kind, message, .. } => tracing::warn!(
                event = "job.completed",
                job_id = %completion.job_id,
                status = "failure",
                kind = %kind,
                error = %message,
                completed = progress.completed,
                total = ?progress.total_hint
            ),
        }
    }

    fn on_finish(&self, progress: &Progress) {
        tracing::info!(
            event = "batch.drained",
            completed = progress.completed,
            failed = progress.failed,
            elapsed_ms = progress.elapsed.as_millis() as u64
        );
    }
}

/// Bounded-concurrency dispatcher.
///
/// At most `concurrency` jobs hold a worker slot at any instant; at most
/// `concurrency * window_factor` are pulled from the job source ahead of completion,
/// so huge or lazily generated job lists never materialize at once.
#[derive(Clone)]
pub struct Scheduler {
    concurrency: usize,
    window_factor: usize,
    observer: Arc<dyn ProgressObserver>,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            window_factor: DEFAULT_WINDOW_FACTOR,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn window_factor(mut self, factor: usize) -> Self {
        self.window_factor = factor.max(1);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Starts dispatching `jobs` on `executor`. Must be called within a tokio runtime.
    ///
    /// Dropping the returned stream aborts jobs still waiting for a slot; jobs already
    /// on a worker thread or in a child process run to completion.
    pub fn stream<I>(&self, executor: Arc<dyn JobExecutor>, jobs: I) -> JobStream
    where
        I: IntoIterator<Item = JobDescriptor>,
        I::IntoIter: Send + 'static,
    {
        let jobs = jobs.into_iter();
        let total_hint = match jobs.size_hint() {
            (lo, Some(hi)) if lo == hi => Some(lo),
            _ => None,
        };
        self.observer.on_start(total_hint);
        tracing::info!(
            event = "scheduler.start",
            mode = executor.mode(),
            concurrency = self.concurrency,
            window = self.concurrency * self.window_factor,
            total = ?total_hint
        );

        let mut stream = JobStream {
            jobs: Box::new(jobs),
            exhausted: false,
            executor,
            slots: Arc::new(Semaphore::new(self.concurrency)),
            window: self.concurrency * self.window_factor,
            tasks: JoinSet::new(),
            observer: self.observer.clone(),
            started: Instant::now(),
            progress: Progress {
                total_hint,
                ..Progress::default()
            },
            finished: false,
        };
        stream.fill();
        stream
    }
}

pub struct JobStream {
    jobs: Box<dyn Iterator<Item = JobDescriptor> + Send>,
    exhausted: bool,
    executor: Arc<dyn JobExecutor>,
    slots: Arc<Semaphore>,
    window: usize,
    tasks: JoinSet<Option<(JobId, JobOutcome, Duration)>>,
    observer: Arc<dyn ProgressObserver>,
    started: Instant,
    progress: Progress,
    finished: bool,
}

impl JobStream {
    fn fill(&mut self) {
        while !self.exhausted && self.tasks.len() < self.window {
            match self.jobs.next() {
                Some(job) => self.submit(job),
                None => self.exhausted = true,
            }
        }
    }

    fn submit(&mut self, job: JobDescriptor) {
        let slots = self.slots.clone();
        let executor = self.executor.clone();
        let job_id = job.id.clone();
        tracing::debug!(event = "job.submitted", job_id = %job_id);
        self.tasks.spawn(async move {
            // a closed semaphore means the stream is draining: this job never starts
            let slot = slots.acquire_owned().await.ok()?;
            let started = Instant::now();
            // the slot moves into the inner task, so a job keeps its slot until it
            // really finishes even if this wrapper is aborted; a panicking executor
            // becomes a per-job failure
            let inner = tokio::spawn(async move {
                let _slot = slot;
                executor.execute(job).await
            });
            let outcome = match inner.await {
                Ok(o) => o,
                Err(e) if e.is_panic() => {
                    JobOutcome::failure(job_id.clone(), ErrorKind::Panicked, e.to_string())
                }
                Err(e) => JobOutcome::failure(job_id.clone(), ErrorKind::WorkerCrashed, e.to_string()),
            };
            Some((job_id, outcome, started.elapsed()))
        });
        self.progress.submitted += 1;
    }

    fn record(&mut self, job_id: JobId, outcome: JobOutcome, elapsed: Duration) -> Completion {
        self.progress.completed += 1;
        if !outcome.is_success() {
            self.progress.failed += 1;
        }
        self.progress.elapsed = self.started.elapsed();
        self.progress.eta = self.eta();

        let completion = Completion {
            job_id,
            outcome,
            elapsed,
        };
        self.observer.on_completion(&completion, &self.progress);
        completion
    }

    /// Next finished job, or `None` once the source is drained and every job reported.
    pub async fn next(&mut self) -> Option<Completion> {
        loop {
            self.fill();
            let joined = match self.tasks.join_next().await {
                Some(j) => j,
                None => {
                    self.finish();
                    return None;
                }
            };
            let (job_id, outcome, elapsed) = match joined {
                Ok(Some(done)) => done,
                Ok(None) => {
                    self.progress.submitted -= 1;
                    continue;
                }
                Err(e) => {
                    // only reachable when the runtime is shutting down
                    tracing::warn!(event = "scheduler.task_lost", error = %e);
                    self.progress.completed += 1;
                    self.progress.failed += 1;
                    continue;
                }
            };

            let completion = self.record(job_id, outcome, elapsed);
            self.fill();
            return Some(completion);
        }
    }

    /// Stops dispatching and waits for every job that already holds a worker slot.
    ///
    /// Jobs still waiting for a slot are discarded without running and no longer count
    /// as submitted. Returns the completions of the jobs that were waited for.
    pub async fn drain_running(&mut self) -> Vec<Completion> {
        self.exhausted = true;
        self.slots.close();
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Some((job_id, outcome, elapsed))) => {
                    done.push(self.record(job_id, outcome, elapsed));
                }
                Ok(None) => self.progress.submitted -= 1,
                Err(e) => tracing::warn!(event = "scheduler.task_lost", error = %e),
            }
        }
        tracing::info!(event = "scheduler.drained", waited_for = done.len());
        self.finish();
        done
    }

    /// Drains the stream, returning every completion.
    pub async fn collect(mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        while let Some(c) = self.next().await {
            out.push(c);
        }
        out
    }

    pub fn progress(&self) -> Progress {
        let mut p = self.progress.clone();
        p.elapsed = self.started.elapsed();
        p
    }

    fn eta(&self) -> Option<Duration> {
        let total = self.progress.total_hint?;
        let done = self.progress.completed;
        if done == 0 {
            return None;
        }
        let per_job = self.progress.elapsed / done as u32;
        Some(per_job * total.saturating_sub(done) as u32)
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.progress.elapsed = self.started.elapsed();
            self.progress.eta = Some(Duration::ZERO);
            self.observer.on_finish(&self.progress);
        }
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        let pending = self.tasks.len();
        if pending > 0 {
            tracing::info!(event = "scheduler.abandoned", pending);
        }
        // JoinSet aborts the wrappers on drop; jobs already holding a slot finish
        // detached, so callers that must not outlive their jobs use drain_running
    }
}

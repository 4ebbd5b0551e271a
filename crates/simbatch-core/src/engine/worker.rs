use crate::aggregate::Aggregate;
use crate::errors::{ErrorKind, JobError};
use crate::model::{
    Cell, JobDescriptor, JobOutcome, ResultTable, JOB_INDEX_COLUMN, PROCESS_ID_COLUMN,
    SOURCE_TABLE_COLUMN,
};
use crate::retry::RetryPolicy;
use crate::simulator::{EngineConfig, ExternalEngine, Simulation, Simulator};
use crate::storage::sink::ResultSink;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Everything a worker needs besides the job itself. Serializable so it can be handed
/// to a child process unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerContext {
    pub sink: ResultSink,
    pub scratch_dir: PathBuf,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    /// Data columns to keep. Names missing from a report are ignored; when none of them
    /// exist the report is stored whole.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subset: Vec<String>,
}

impl WorkerContext {
    pub fn new(sink: ResultSink, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink,
            scratch_dir: scratch_dir.into(),
            retry: RetryPolicy::default(),
            aggregate: None,
            subset: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_aggregate(mut self, aggregate: Option<Aggregate>) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn with_subset(mut self, subset: Vec<String>) -> Self {
        self.subset = subset;
        self
    }
}

/// Cleans up on every exit path, panics included.
struct Loaded(Box<dyn Simulation>);

impl Drop for Loaded {
    fn drop(&mut self) {
        self.0.cleanup();
    }
}

/// Runs one job end to end: load, apply overrides, execute, tag, persist, clean up.
///
/// Never returns an error: every failure becomes a [`JobOutcome::Failure`]. Transient
/// failures rerun the whole sequence per `ctx.retry`; a job's tables are persisted in
/// one transaction, so a retried attempt never duplicates rows.
pub fn run_job(simulator: &dyn Simulator, job: &JobDescriptor, ctx: &WorkerContext) -> JobOutcome {
    let started = Instant::now();
    let span = tracing::info_span!("job", job_id = %job.id);
    let _enter = span.enter();

    let (result, attempts) = ctx.retry.run(
        |attempt| {
            if attempt > 1 {
                tracing::info!(event = "job.retry", attempt);
            }
            attempt_once(simulator, job, ctx)
        },
        |e: &JobError| e.kind.is_transient(),
    );

    match result {
        Ok((tables, rows)) => {
            tracing::debug!(event = "job.persisted", tables = tables.len(), rows, attempts);
            JobOutcome::Success {
                job_id: job.id.clone(),
                tables,
                rows,
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }
        Err(e) => {
            tracing::warn!(
                event = "job.failed",
                kind = %e.kind,
                attempts,
                error = %e.message
            );
            JobOutcome::Failure {
                job_id: job.id.clone(),
                kind: e.kind,
                message: e.message,
                attempts,
            }
        }
    }
}

fn attempt_once(
    simulator: &dyn Simulator,
    job: &JobDescriptor,
    ctx: &WorkerContext,
) -> Result<(Vec<String>, usize), JobError> {
    let mut sim = Loaded(simulator.load(job, &ctx.scratch_dir)?);
    sim.0.apply(&job.overrides)?;
    let reports = sim.0.execute()?;

    let tables: Vec<ResultTable> = reports
        .into_iter()
        .map(|t| shape(job, t, ctx))
        .collect();
    let rows = tables.iter().map(ResultTable::len).sum();
    let names = ctx.sink.insert_all(&tables)?;
    drop(sim);
    Ok((names, rows))
}

/// Subset, aggregate, then tag with metadata, source table, worker process and job id.
fn shape(job: &JobDescriptor, table: ResultTable, ctx: &WorkerContext) -> ResultTable {
    let table = select_columns(table, &ctx.subset);
    let mut table = match ctx.aggregate {
        Some(a) => a.apply(&table),
        None => table,
    };
    for (key, value) in &job.metadata {
        table.set_constant(key, value.clone());
    }
    let source = Cell::from(table.name.clone());
    table.set_constant(SOURCE_TABLE_COLUMN, source);
    table.set_constant(PROCESS_ID_COLUMN, Cell::from(i64::from(std::process::id())));
    table.set_constant(JOB_INDEX_COLUMN, Cell::from(job.id.as_str()));
    table
}

fn select_columns(table: ResultTable, subset: &[String]) -> ResultTable {
    if subset.is_empty() {
        return table;
    }
    let keep: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| subset.contains(c))
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return table;
    }
    ResultTable {
        name: table.name,
        columns: keep.iter().map(|&i| table.columns[i].clone()).collect(),
        rows: table
            .rows
            .into_iter()
            .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
            .collect(),
    }
}

/// What a parent process sends to a worker child on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job: JobDescriptor,
    pub context: WorkerContext,
    pub engine: EngineConfig,
}

/// Child side of process mode: reads one [`WorkerRequest`], runs it through the
/// external engine and writes the outcome as a single JSON line.
///
/// An unreadable request is the only error; job failures are reported in the outcome.
pub fn serve_worker_request(input: impl Read, mut output: impl Write) -> Result<JobOutcome, JobError> {
    let mut raw = String::new();
    BufReader::new(input)
        .read_to_string(&mut raw)
        .map_err(|e| JobError::io("read worker request", e))?;
    let req: WorkerRequest = serde_json::from_str(&raw).map_err(|e| {
        JobError::new(ErrorKind::Protocol, format!("invalid worker request: {}", e))
    })?;

    let engine = ExternalEngine::new(req.engine);
    let outcome = run_job(&engine, &req.job, &req.context);

    let line = serde_json::to_string(&outcome)
        .map_err(|e| JobError::new(ErrorKind::Protocol, e.to_string()))?;
    writeln!(output, "{}", line).map_err(|e| JobError::io("write outcome", e))?;
    output.flush().map_err(|e| JobError::io("flush outcome", e))?;
    Ok(outcome)
}

/// Parent side: the outcome is the last non-empty line a child printed.
pub fn parse_worker_output(stdout: &[u8]) -> Result<JobOutcome, JobError> {
    let last = BufReader::new(stdout)
        .lines()
        .map_while(Result::ok)
        .filter(|l| !l.trim().is_empty())
        .last()
        .ok_or_else(|| JobError::new(ErrorKind::Protocol, "worker printed no outcome"))?;
    serde_json::from_str(&last).map_err(|e| {
        JobError::new(
            ErrorKind::Protocol,
            format!("unparsable worker outcome '{}': {}", last.trim(), e),
        )
    })
}

#![allow(dead_code)]

use simbatch_core::{
    Cell, ErrorKind, JobDescriptor, JobError, ResultSink, ResultTable, RunOptions, Simulation,
    Simulator,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ROWS_PER_JOB: usize = 3;

/// In-memory engine double. Reads its behaviour from the job's overrides:
/// `Input` (echoed into every row), `Schema` ("A" or "B"), `Fail` (fatal error) and
/// `DelayMs` (overrides the engine-wide delay for that job).
#[derive(Default)]
pub struct FakeEngine {
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub executed: AtomicUsize,
    pub delay: Duration,
}

impl FakeEngine {
    pub fn with_delay(ms: u64) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::from_millis(ms),
            ..Self::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

struct FakeRun {
    engine: Arc<FakeEngine>,
    overrides: BTreeMap<String, serde_json::Value>,
}

/// The simulator handed to the runner shares counters with the test through an `Arc`.
pub struct Shared(pub Arc<FakeEngine>);

impl Simulator for Shared {
    fn load(&self, _job: &JobDescriptor, _scratch: &Path) -> Result<Box<dyn Simulation>, JobError> {
        Ok(Box::new(FakeRun {
            engine: self.0.clone(),
            overrides: BTreeMap::new(),
        }))
    }
}

impl Simulation for FakeRun {
    fn apply(&mut self, overrides: &BTreeMap<String, serde_json::Value>) -> Result<(), JobError> {
        if overrides.get("Fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(JobError::new(
                ErrorKind::InvalidOverride,
                "Fail: no such parameter",
            ));
        }
        self.overrides = overrides.clone();
        Ok(())
    }

    fn execute(&mut self) -> Result<Vec<ResultTable>, JobError> {
        let e = &self.engine;
        e.executed.fetch_add(1, Ordering::SeqCst);
        let now = e.active.fetch_add(1, Ordering::SeqCst) + 1;
        e.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .overrides
            .get("DelayMs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(e.delay);
        std::thread::sleep(delay);
        e.active.fetch_sub(1, Ordering::SeqCst);

        let input = self.overrides.get("Input").and_then(|v| v.as_f64()).unwrap_or(-1.0);
        let schema = self
            .overrides
            .get("Schema")
            .and_then(|v| v.as_str())
            .unwrap_or("A")
            .to_string();

        let (name, columns) = if schema == "B" {
            ("HarvestReport", vec!["Input".to_string(), "Grain".to_string()])
        } else {
            ("DailyReport", vec!["Input".to_string(), "Yield".to_string(), "Date".to_string()])
        };
        let mut t = ResultTable::new(name, columns.clone());
        for day in 0..ROWS_PER_JOB {
            let mut row = vec![Cell::Number(input), Cell::Number(input * 10.0 + day as f64)];
            if columns.len() == 3 {
                row.push(Cell::from(format!("1990-01-0{}", day + 1)));
            }
            t.rows.push(row);
        }
        Ok(vec![t])
    }

    fn cleanup(&mut self) {}
}

pub fn job(i: usize) -> JobDescriptor {
    JobDescriptor::new(i, "fake.apsimx").with_override("Input", serde_json::json!(i))
}

pub fn job_with_schema(i: usize, schema: &str) -> JobDescriptor {
    job(i).with_override("Schema", serde_json::json!(schema))
}

pub fn slow_job(i: usize, ms: u64) -> JobDescriptor {
    job(i).with_override("DelayMs", serde_json::json!(ms))
}

pub fn failing_job(i: usize) -> JobDescriptor {
    job(i).with_override("Fail", serde_json::json!(true))
}

pub fn options(workers: i64, scratch_root: &Path) -> RunOptions {
    RunOptions {
        workers,
        scratch_root: scratch_root.to_path_buf(),
        retry: simbatch_core::RetryPolicy {
            retries: 2,
            backoff_ms: 1,
        },
        ..RunOptions::default()
    }
}

pub fn sink(dir: &Path) -> ResultSink {
    ResultSink::new(dir.join("results.db"))
}

/// Job ids present in a column, as strings.
pub fn ids_in(table: &ResultTable) -> Vec<String> {
    let mut ids: Vec<String> = table
        .column("JobIndex")
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.to_string())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

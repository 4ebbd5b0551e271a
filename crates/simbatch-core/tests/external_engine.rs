#![cfg(unix)]

use rusqlite::Connection;
use simbatch_core::engine::worker::{run_job, WorkerContext};
use simbatch_core::{
    Cell, EngineConfig, ErrorKind, ExternalEngine, JobDescriptor, JobOutcome, ResultSink,
    RetryPolicy,
};
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const MODEL: &str = r#"{
  "Name": "Simulations",
  "Children": [
    {
      "Name": "Simulation",
      "Children": [
        { "Name": "Field", "Children": [ { "Name": "Fertilise at sowing", "Amount": 0 } ] }
      ]
    }
  ]
}"#;

struct Fixture {
    dir: TempDir,
    model: PathBuf,
    output_db: PathBuf,
    seen: PathBuf,
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let dir = tempdir()?;
        let model = dir.path().join("maize.apsimx");
        std::fs::write(&model, MODEL)?;

        // what the engine "produces": two reports plus an internal table
        let output_db = dir.path().join("engine_output.db");
        let conn = Connection::open(&output_db)?;
        conn.execute_batch(
            "CREATE TABLE Report (Yield REAL, Date TEXT);
             INSERT INTO Report VALUES (1200.5, '1990-12-01'), (1300.0, '1991-12-01');
             CREATE TABLE HarvestReport (Grain INTEGER);
             INSERT INTO HarvestReport VALUES (7);
             CREATE TABLE _Messages (Text TEXT);",
        )?;

        let seen = dir.path().join("seen");
        std::fs::create_dir_all(&seen)?;
        Ok(Self {
            dir,
            model,
            output_db,
            seen,
        })
    }

    /// An engine that records the model it was given, then runs `tail` of shell.
    fn engine(&self, tail: &str) -> EngineConfig {
        let script = format!(
            "cp \"$1\" '{seen}/'; {tail}",
            seen = self.seen.display(),
            tail = tail
        );
        let mut cfg = EngineConfig::new("/bin/sh");
        cfg.args = vec!["-c".into(), script, "engine".into()];
        cfg
    }

    fn writes_output(&self) -> String {
        format!("cp '{}' \"${{1%.*}}.db\"", self.output_db.display())
    }

    fn ctx(&self) -> WorkerContext {
        WorkerContext::new(
            ResultSink::new(self.dir.path().join("results.db")),
            self.dir.path().join("run_scratch"),
        )
        .with_retry(RetryPolicy::none())
    }

    fn job(&self, id: usize) -> JobDescriptor {
        JobDescriptor::new(id, self.model.to_string_lossy())
    }

    fn seen_models(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.seen)
            .map(|rd| rd.flatten().map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}

fn scratch_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0)
}

#[test]
fn overrides_reach_the_engine_and_reports_are_stored() -> anyhow::Result<()> {
    let fx = Fixture::new()?;
    let engine = ExternalEngine::new(fx.engine(&fx.writes_output()));
    let ctx = fx.ctx();
    let job = fx.job(3).with_override(
        ".Simulations.Simulation.Field.Fertilise at sowing.Amount",
        serde_json::json!(150),
    );

    let outcome = run_job(&engine, &job, &ctx);
    let JobOutcome::Success { tables, rows, .. } = outcome.clone() else {
        panic!("expected success, got {:?}", outcome);
    };
    assert_eq!(tables.len(), 2);
    assert_eq!(rows, 3);

    let seen = fx.seen_models();
    assert_eq!(seen.len(), 1);
    let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&seen[0])?)?;
    assert_eq!(
        doc["Children"][0]["Children"][0]["Children"][0]["Amount"],
        serde_json::json!(150)
    );
    // the template itself is untouched
    assert!(std::fs::read_to_string(&fx.model)?.contains("\"Amount\": 0"));

    let all: Vec<_> = ctx
        .sink
        .written_tables()?
        .into_iter()
        .map(|t| ctx.sink.read_table(&t))
        .collect::<Result<_, _>>()?;
    let report = all
        .iter()
        .find(|t| t.column_index("Yield").is_some())
        .expect("report table");
    assert_eq!(report.column("SourceTable").unwrap(), vec![&Cell::from("Report"); 2]);
    assert_eq!(report.column("JobIndex").unwrap(), vec![&Cell::from("3"); 2]);
    assert!(all.iter().all(|t| t.column_index("Text").is_none()));

    assert_eq!(scratch_files(&fx.dir.path().join("run_scratch")), 0);
    Ok(())
}

#[test]
fn unknown_override_path_fails_without_running_or_retrying() -> anyhow::Result<()> {
    let fx = Fixture::new()?;
    let engine = ExternalEngine::new(fx.engine(&fx.writes_output()));
    let ctx = fx.ctx().with_retry(RetryPolicy {
        retries: 3,
        backoff_ms: 1,
    });
    let job = fx
        .job(0)
        .with_override(".Simulations.Simulation.Weather.FileName", serde_json::json!("x.met"));

    let outcome = run_job(&engine, &job, &ctx);
    assert!(matches!(
        outcome,
        JobOutcome::Failure { kind: ErrorKind::InvalidOverride, attempts: 1, .. }
    ));
    assert!(fx.seen_models().is_empty());
    assert!(ctx.sink.written_tables()?.is_empty());
    Ok(())
}

#[test]
fn nonzero_exit_carries_stderr() -> anyhow::Result<()> {
    let fx = Fixture::new()?;
    let engine = ExternalEngine::new(fx.engine("echo 'weather file not found' >&2; exit 2"));
    match run_job(&engine, &fx.job(1), &fx.ctx()) {
        JobOutcome::Failure { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::EngineFailed);
            assert!(message.contains("weather file not found"), "{}", message);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    Ok(())
}

#[test]
fn clean_exit_without_output_is_missing_output() -> anyhow::Result<()> {
    let fx = Fixture::new()?;
    let engine = ExternalEngine::new(fx.engine("exit 0"));
    let outcome = run_job(&engine, &fx.job(1), &fx.ctx());
    assert!(matches!(
        outcome,
        JobOutcome::Failure { kind: ErrorKind::MissingOutput, .. }
    ));
    Ok(())
}

#[test]
fn required_report_must_exist() -> anyhow::Result<()> {
    let fx = Fixture::new()?;
    let mut cfg = fx.engine(&fx.writes_output());
    cfg.reports = vec!["Report".into(), "SoilReport".into()];
    let outcome = run_job(&ExternalEngine::new(cfg), &fx.job(1), &fx.ctx());
    match outcome {
        JobOutcome::Failure { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::MissingOutput);
            assert!(message.contains("SoilReport"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    Ok(())
}

#[test]
fn slow_engine_is_killed_at_deadline() -> anyhow::Result<()> {
    let fx = Fixture::new()?;
    let mut cfg = fx.engine("sleep 5");
    cfg.timeout_seconds = Some(1);
    let started = std::time::Instant::now();
    let outcome = run_job(&ExternalEngine::new(cfg), &fx.job(1), &fx.ctx());
    assert!(matches!(
        outcome,
        JobOutcome::Failure { kind: ErrorKind::Timeout, .. }
    ));
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    Ok(())
}

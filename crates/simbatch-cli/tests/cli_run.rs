use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn simbatch() -> Command {
    let mut cmd = Command::cargo_bin("simbatch").unwrap();
    cmd.env_remove("SIMBATCH_WORKERS")
        .env_remove("SIMBATCH_MODE")
        .env("SIMBATCH_LOG", "warn");
    cmd
}

#[test]
fn init_writes_a_loadable_sample() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("simbatch.yaml");

    simbatch()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stderr(contains("created"));
    assert!(config.exists());

    // second init leaves the file alone
    simbatch()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stderr(contains("already exists"));

    // sample models do not exist here, so every job fails
    simbatch()
        .args(["run", "--strict", "--no-progress", "--mode", "threads", "--workers", "1", "--config"])
        .arg(&config)
        .assert()
        .code(3)
        .stderr(contains("all 2 jobs failed"));
}

#[test]
fn broken_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("simbatch.yaml");
    fs::write(&config, "version: 1\nsink: out.db\nparallel: 4\njobs: []\n").unwrap();

    simbatch()
        .args(["run", "--strict", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(contains("config error"));
}

#[test]
fn zero_workers_flag_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_batch(dir.path(), 1, &[]);
    simbatch()
        .args(["run", "--no-progress", "--mode", "threads", "--workers", "0", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(contains("invalid concurrency"));
}

/// A batch whose engine is a shell script that copies a prepared output database next
/// to the model it is given. Job ids in `failing` point at a model that does not exist.
fn write_batch(dir: &Path, jobs: usize, failing: &[usize]) -> std::path::PathBuf {
    let model = dir.join("model.apsimx");
    fs::write(
        &model,
        r#"{"Name":"Simulations","Children":[{"Name":"Field","Children":[{"Name":"Sow","Amount":1}]}]}"#,
    )
    .unwrap();

    let output = dir.join("engine_output.db");
    let conn = rusqlite::Connection::open(&output).unwrap();
    conn.execute_batch(
        "CREATE TABLE Report (Yield REAL, Date TEXT);
         INSERT INTO Report VALUES (10.5, '1990-01-01'), (11.5, '1990-01-02');",
    )
    .unwrap();
    drop(conn);

    let mut yaml = format!(
        r#"version: 1
sink: results.db
scratch_root: .
engine:
  program: /bin/sh
  args: ["-c", "cp '{}' \"${{1%.*}}.db\"", "engine"]
settings:
  retries: 0
jobs:
"#,
        output.display()
    );
    for i in 0..jobs {
        let source = if failing.contains(&i) {
            "missing.apsimx"
        } else {
            "model.apsimx"
        };
        yaml.push_str(&format!(
            "  - id: {i}\n    source: {source}\n    overrides:\n      \".Simulations.Field.Sow.Amount\": {i}\n    metadata:\n      Rate: {i}\n"
        ));
    }
    let config = dir.join("simbatch.yaml");
    fs::write(&config, yaml).unwrap();
    config
}

#[cfg(unix)]
#[test]
fn threads_run_collects_results_and_exports() {
    let dir = TempDir::new().unwrap();
    let config = write_batch(dir.path(), 3, &[]);
    let csv = dir.path().join("out/results.csv");
    let summary = dir.path().join("summary.json");

    simbatch()
        .args(["run", "--no-progress", "--mode", "threads", "--workers", "2", "--config"])
        .arg(&config)
        .arg("--csv")
        .arg(&csv)
        .arg("--summary-json")
        .arg(&summary)
        .assert()
        .success()
        .stderr(contains("Summary: 3 succeeded, 0 failed"));

    let body = fs::read_to_string(&csv).unwrap();
    assert_eq!(body.lines().count(), 1 + 3 * 2);
    let header = body.lines().next().unwrap();
    for col in ["Yield", "Date", "Rate", "SourceTable", "ProcessID", "JobIndex"] {
        assert!(header.contains(col), "{} missing from {}", col, header);
    }

    let s: serde_json::Value = serde_json::from_str(&fs::read_to_string(&summary).unwrap()).unwrap();
    assert_eq!(s["succeeded"], 3);
    assert_eq!(s["tables"].as_array().unwrap().len(), 1);

    simbatch()
        .args(["tables", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("__sim_table__"));

    let out = simbatch()
        .args(["results", "--format", "json", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(out.status.success());
    let view: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(view["rows"].as_array().unwrap().len(), 6);

    // a finished run leaves no scratch of its own; older leftovers need --scratch
    let stale = dir.path().join("stale_scratch");
    fs::create_dir(&stale).unwrap();
    simbatch().args(["clear", "--config"]).arg(&config).assert().success();
    assert!(!dir.path().join("results.db").exists());
    assert!(stale.exists());
    simbatch()
        .args(["clear", "--scratch", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stderr(contains("removed 1 scratch directories"));
    assert!(!stale.exists());
}

#[cfg(unix)]
#[test]
fn failed_jobs_are_reported_with_exit_code_one() {
    let dir = TempDir::new().unwrap();
    let config = write_batch(dir.path(), 3, &[1]);

    simbatch()
        .args(["run", "--no-progress", "--mode", "threads", "--workers", "2", "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .stderr(contains("Summary: 2 succeeded, 1 failed"))
        .stderr(contains("missing.apsimx"));

    // only job 1 is left to run; it still fails, the others are not rerun
    simbatch()
        .args(["run", "--no-progress", "--mode", "threads", "--skip-completed", "--config"])
        .arg(&config)
        .assert()
        .code(3)
        .stderr(contains("all 1 jobs failed"));
}

#[cfg(unix)]
#[test]
fn process_mode_runs_each_job_in_a_child() {
    let dir = TempDir::new().unwrap();
    let config = write_batch(dir.path(), 2, &[]);

    simbatch()
        .args(["run", "--no-progress", "--mode", "processes", "--workers", "1", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stderr(contains("Summary: 2 succeeded, 0 failed, 0 skipped, 1 tables"));

    let conn = rusqlite::Connection::open(dir.path().join("results.db")).unwrap();
    let table: String = conn
        .query_row("SELECT name FROM table_names", [], |r| r.get(0))
        .unwrap();
    let jobs: i64 = conn
        .query_row(
            &format!("SELECT COUNT(DISTINCT JobIndex) FROM \"{}\"", table),
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(jobs, 2);
    // one child per job
    let pids: Vec<i64> = conn
        .prepare(&format!("SELECT DISTINCT ProcessID FROM \"{}\"", table))
        .unwrap()
        .query_map([], |r| r.get::<_, f64>(0).map(|p| p as i64))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pids.len(), 2);
}

use simbatch_core::{
    run_job, ErrorKind, JobDescriptor, JobError, JobOutcome, ResultSink, RetryPolicy, Simulation,
    Simulator, WorkerContext,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

struct Broken;

impl Simulator for Broken {
    fn load(&self, _job: &JobDescriptor, _scratch: &Path) -> Result<Box<dyn Simulation>, JobError> {
        Err(JobError::new(ErrorKind::InvalidOverride, "no node named 'Weather'"))
    }
}

#[test]
fn failed_job_emits_structured_event() -> anyhow::Result<()> {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let buffer_clone = buffer.clone();

    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(move || MockWriter(buffer_clone.clone()))
        .finish();

    let dir = tempfile::tempdir()?;
    let ctx = WorkerContext::new(ResultSink::new(dir.path().join("out.db")), dir.path())
        .with_retry(RetryPolicy::none());
    let outcome = tracing::subscriber::with_default(subscriber, || {
        run_job(&Broken, &JobDescriptor::new("9", "m.apsimx"), &ctx)
    });
    assert!(!outcome.is_success());
    assert!(matches!(outcome, JobOutcome::Failure { attempts: 1, .. }));

    let output = String::from_utf8(buffer.lock().unwrap().clone())?;
    assert!(output.contains("\"event\":\"job.failed\""), "{}", output);
    assert!(output.contains("\"kind\":\"invalid_override\""));
    assert!(output.contains("\"job_id\":\"9\""));
    assert!(output.contains("\"timestamp\""));
    Ok(())
}

struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

use crate::engine::worker::{parse_worker_output, run_job, WorkerContext, WorkerRequest};
use crate::errors::ErrorKind;
use crate::model::{JobDescriptor, JobOutcome};
use crate::simulator::external::tail;
use crate::simulator::{EngineConfig, Simulator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Runs one job to completion. Implementations never fail: errors come back as
/// [`JobOutcome::Failure`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: JobDescriptor) -> JobOutcome;

    fn mode(&self) -> &'static str;
}

/// In-process execution on tokio's blocking pool.
pub struct ThreadExecutor {
    simulator: Arc<dyn Simulator>,
    ctx: Arc<WorkerContext>,
}

impl ThreadExecutor {
    pub fn new(simulator: Arc<dyn Simulator>, ctx: WorkerContext) -> Self {
        Self {
            simulator,
            ctx: Arc::new(ctx),
        }
    }
}

#[async_trait]
impl JobExecutor for ThreadExecutor {
    async fn execute(&self, job: JobDescriptor) -> JobOutcome {
        let simulator = self.simulator.clone();
        let ctx = self.ctx.clone();
        let job_id = job.id.clone();
        match tokio::task::spawn_blocking(move || run_job(simulator.as_ref(), &job, &ctx)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let msg = panic_message(e.into_panic());
                tracing::error!(event = "job.panicked", job_id = %job_id, error = %msg);
                JobOutcome::failure(job_id, ErrorKind::Panicked, msg)
            }
            Err(e) => JobOutcome::failure(job_id, ErrorKind::WorkerCrashed, e.to_string()),
        }
    }

    fn mode(&self) -> &'static str {
        "threads"
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// The command a parent re-invokes for each job in process mode, typically
/// `simbatch worker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub engine: EngineConfig,
}

impl WorkerCommand {
    /// The running executable's own `worker` subcommand.
    pub fn current_exe(engine: EngineConfig) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".into()],
            engine,
        })
    }
}

/// One child process per job, speaking the JSON worker protocol over stdio.
pub struct ProcessExecutor {
    command: WorkerCommand,
    ctx: WorkerContext,
}

impl ProcessExecutor {
    pub fn new(command: WorkerCommand, ctx: WorkerContext) -> Self {
        Self { command, ctx }
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: JobDescriptor) -> JobOutcome {
        let job_id = job.id.clone();
        let request = WorkerRequest {
            job,
            context: self.ctx.clone(),
            engine: self.command.engine.clone(),
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => return JobOutcome::failure(job_id, ErrorKind::Protocol, e.to_string()),
        };

        let spawned = tokio::process::Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                return JobOutcome::failure(
                    job_id,
                    ErrorKind::WorkerCrashed,
                    format!("failed to start {}: {}", self.command.program.display(), e),
                )
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // a child that exits without reading shows up below as a crash
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(event = "worker.stdin_closed", job_id = %job_id, error = %e);
            }
        }

        let output = match child.wait_with_output().await {
            Ok(o) => o,
            Err(e) => return JobOutcome::failure(job_id, ErrorKind::WorkerCrashed, e.to_string()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return JobOutcome::failure(
                job_id,
                ErrorKind::WorkerCrashed,
                format!("worker exited with {}: {}", output.status, tail(&stderr)),
            );
        }

        match parse_worker_output(&output.stdout) {
            Ok(outcome) if outcome.job_id() == &job_id => outcome,
            Ok(outcome) => JobOutcome::failure(
                job_id,
                ErrorKind::Protocol,
                format!("worker answered for job {}", outcome.job_id()),
            ),
            Err(e) => JobOutcome::failure(job_id, e.kind, e.message),
        }
    }

    fn mode(&self) -> &'static str {
        "processes"
    }
}

//! Job dispatch: the per-job worker sequence, the executors that host it (threads or
//! child processes) and the bounded scheduler that feeds them.

pub mod executor;
pub mod scheduler;
pub mod worker;

pub use executor::{JobExecutor, ProcessExecutor, ThreadExecutor, WorkerCommand};
pub use scheduler::{Completion, JobStream, Progress, ProgressObserver, Scheduler, TracingObserver};
pub use worker::{run_job, serve_worker_request, WorkerContext, WorkerRequest};

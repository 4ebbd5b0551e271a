pub mod aggregate;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod manager;
pub mod model;
pub mod report;
pub mod retry;
pub mod scratch;
pub mod simulator;
pub mod storage;

pub use aggregate::Aggregate;
pub use config::{load_config, BatchConfig};
pub use engine::executor::{JobExecutor, ProcessExecutor, ThreadExecutor, WorkerCommand};
pub use engine::scheduler::{Completion, JobStream, Progress, ProgressObserver, Scheduler};
pub use engine::worker::{run_job, WorkerContext};
pub use errors::{ConfigError, ErrorKind, JobError, RunError, SinkError};
pub use manager::{Dispatch, ParallelRunner, RunOptions, RunPhase, RunSummary};
pub use model::{Cell, JobDescriptor, JobFailure, JobId, JobOutcome, ResultTable};
pub use retry::RetryPolicy;
pub use simulator::{EngineConfig, ExternalEngine, Simulation, Simulator};
pub use storage::export::IfExists;
pub use storage::sink::ResultSink;
pub use storage::view::Axis;

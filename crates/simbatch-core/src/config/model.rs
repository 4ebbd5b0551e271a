use crate::aggregate::Aggregate;
use crate::fingerprint::DEFAULT_TABLE_PREFIX;
use crate::manager::RunOptions;
use crate::model::JobDescriptor;
use crate::retry::RetryPolicy;
use crate::simulator::EngineConfig;
use crate::storage::sink::ResultSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A batch file: where results go, how to run the engine and which jobs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub version: u32,
    pub sink: PathBuf,
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Threads,
    #[default]
    Processes,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Threads => "threads",
            Mode::Processes => "processes",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threads" | "thread" => Ok(Mode::Threads),
            "processes" | "process" => Ok(Mode::Processes),
            other => Err(format!("unknown mode '{}' (threads|processes)", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Worker count; negative counts back from the CPU total. Unset leaves two CPUs free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<i64>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "yes")]
    pub clear_sink: bool,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub skip_completed: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subset: Vec<String>,
    #[serde(default = "default_window_factor")]
    pub window_factor: usize,
}

fn yes() -> bool {
    true
}

fn default_retries() -> u32 {
    RetryPolicy::default().retries
}

fn default_backoff_ms() -> u64 {
    RetryPolicy::default().backoff_ms
}

fn default_window_factor() -> usize {
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: None,
            mode: Mode::default(),
            clear_sink: true,
            fail_fast: false,
            skip_completed: false,
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            aggregate: None,
            subset: Vec::new(),
            window_factor: default_window_factor(),
        }
    }
}

impl BatchConfig {
    pub fn result_sink(&self) -> ResultSink {
        ResultSink::new(&self.sink)
            .with_prefix(self.table_prefix.clone())
            .with_retry(self.retry_policy())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.settings.retries,
            backoff_ms: self.settings.backoff_ms,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            workers: self.settings.workers.unwrap_or(defaults.workers),
            clear_sink: self.settings.clear_sink,
            fail_fast: self.settings.fail_fast,
            skip_completed: self.settings.skip_completed,
            retry: self.retry_policy(),
            aggregate: self.settings.aggregate,
            subset: self.settings.subset.clone(),
            scratch_root: self.scratch_root.clone(),
            window_factor: self.settings.window_factor,
        }
    }
}

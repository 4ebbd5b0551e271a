use crate::errors::{ErrorKind, JobError};
use crate::fingerprint::sha256_hex;
use crate::model::{JobDescriptor, ResultTable};
use crate::scratch::remove_file_with_retry;
use crate::simulator::overrides;
use crate::simulator::{Simulation, Simulator};
use crate::storage::sink::read_all;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_BYTES: usize = 2000;
const SCRATCH_DIGEST_LEN: usize = 8;

fn default_output_extension() -> String {
    "db".into()
}

/// How to invoke the external engine executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub program: PathBuf,
    /// Arguments placed before the model path.
    #[serde(default)]
    pub args: Vec<String>,
    /// Deadline after which the worker kills the engine and fails the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Extension of the output database written next to the model file.
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    /// Report tables to read. Empty means every non-internal table; listed tables are
    /// required to exist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<String>,
}

impl EngineConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_seconds: None,
            output_extension: default_output_extension(),
            reports: Vec::new(),
        }
    }
}

/// Runs models through an external executable: `program [args..] <model>`.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    config: EngineConfig,
}

impl ExternalEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Simulator for ExternalEngine {
    fn load(&self, job: &JobDescriptor, scratch: &Path) -> Result<Box<dyn Simulation>, JobError> {
        let source = Path::new(&job.source);
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        let ext = source.extension().and_then(|s| s.to_str()).unwrap_or("apsimx");

        std::fs::create_dir_all(scratch).map_err(|e| JobError::io("create scratch dir", e))?;
        // job id in the file name keeps concurrent copies of one template apart
        let model_path = scratch.join(format!("{}_{}.{}", stem, scratch_key(job.id.as_str()), ext));
        std::fs::copy(source, &model_path).map_err(|e| {
            JobError::io(&format!("copy model {}", source.display()), e)
        })?;

        let output_path = model_path.with_extension(&self.config.output_extension);
        Ok(Box::new(ExternalSimulation {
            config: self.config.clone(),
            model_path,
            output_path,
        }))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Filename-safe form of a job id that stays unique: the sanitized id plus a short
/// digest of the raw id, so `plot.1` and `plot_1` never share a file.
fn scratch_key(id: &str) -> String {
    format!("{}_{}", sanitize(id), &sha256_hex(id)[..SCRATCH_DIGEST_LEN])
}

struct ExternalSimulation {
    config: EngineConfig,
    model_path: PathBuf,
    output_path: PathBuf,
}

impl ExternalSimulation {
    fn run_engine(&self) -> Result<(), JobError> {
        let cwd = self.model_path.parent().unwrap_or(Path::new("."));
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(&self.model_path)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                JobError::new(
                    ErrorKind::EngineFailed,
                    format!("failed to start {}: {}", self.config.program.display(), e),
                )
            })?;

        // drained on its own thread so a chatty engine cannot fill the pipe and stall
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                use std::io::Read;
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = self
            .config
            .timeout_seconds
            .map(|s| Instant::now() + Duration::from_secs(s));
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(JobError::io("wait for engine", e)),
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(JobError::new(
                    ErrorKind::Timeout,
                    format!(
                        "engine exceeded {}s on {}",
                        self.config.timeout_seconds.unwrap_or_default(),
                        self.model_path.display()
                    ),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(JobError::new(
                ErrorKind::EngineFailed,
                format!("engine exited with {}: {}", status, tail(&stderr)),
            ));
        }
        Ok(())
    }

    fn read_output(&self) -> Result<Vec<ResultTable>, JobError> {
        if !self.output_path.exists() {
            return Err(JobError::new(
                ErrorKind::MissingOutput,
                format!("engine wrote no output at {}", self.output_path.display()),
            ));
        }
        let classify = |e: rusqlite::Error| {
            let busy = matches!(
                &e,
                rusqlite::Error::SqliteFailure(f, _)
                    if matches!(f.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            );
            let kind = if busy { ErrorKind::Transient } else { ErrorKind::Io };
            JobError::new(kind, format!("reading {}: {}", self.output_path.display(), e))
        };

        let conn = Connection::open_with_flags(&self.output_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(classify)?;
        let available: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .map_err(classify)?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0)).map_err(classify)?;
            rows.collect::<Result<_, _>>().map_err(classify)?
        };

        let wanted: Vec<String> = if self.config.reports.is_empty() {
            available
                .into_iter()
                .filter(|n| !n.starts_with('_') && !n.starts_with("sqlite_"))
                .collect()
        } else {
            for r in &self.config.reports {
                if !available.contains(r) {
                    return Err(JobError::new(
                        ErrorKind::MissingOutput,
                        format!("report table '{}' missing from {}", r, self.output_path.display()),
                    ));
                }
            }
            self.config.reports.clone()
        };
        if wanted.is_empty() {
            return Err(JobError::new(
                ErrorKind::MissingOutput,
                format!("no report tables in {}", self.output_path.display()),
            ));
        }

        let mut tables = Vec::with_capacity(wanted.len());
        for name in &wanted {
            tracing::trace!(event = "engine.read_table", table = %name);
            tables.push(read_all(&conn, name).map_err(classify)?);
        }
        Ok(tables)
    }
}

impl Simulation for ExternalSimulation {
    fn apply(&mut self, overrides: &BTreeMap<String, serde_json::Value>) -> Result<(), JobError> {
        if overrides.is_empty() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.model_path)
            .map_err(|e| JobError::io("read model copy", e))?;
        let mut doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            JobError::new(
                ErrorKind::InvalidOverride,
                format!("model {} is not JSON: {}", self.model_path.display(), e),
            )
        })?;
        overrides::apply_all(&mut doc, overrides)?;
        let out = serde_json::to_string_pretty(&doc)
            .map_err(|e| JobError::new(ErrorKind::Io, e.to_string()))?;
        std::fs::write(&self.model_path, out).map_err(|e| JobError::io("write model copy", e))
    }

    fn execute(&mut self) -> Result<Vec<ResultTable>, JobError> {
        // a stale artifact from an earlier attempt must not be mistaken for fresh output
        remove_file_with_retry(&self.output_path);
        self.run_engine()?;
        self.read_output()
    }

    fn cleanup(&mut self) {
        remove_file_with_retry(&self.model_path);
        remove_file_with_retry(&self.output_path);
        for suffix in ["-journal", "-wal", "-shm"] {
            let mut p = OsString::from(self.output_path.as_os_str());
            p.push(suffix);
            remove_file_with_retry(Path::new(&p));
        }
    }
}

/// Last bytes of a child's stderr, trimmed, for error messages.
pub(crate) fn tail(s: &str) -> &str {
    let s = s.trim();
    if s.len() <= STDERR_TAIL_BYTES {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL_BYTES;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

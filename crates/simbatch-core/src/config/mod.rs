use crate::errors::ConfigError;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

pub mod model;

pub use model::{BatchConfig, Mode, Settings};

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

pub const ENV_WORKERS: &str = "SIMBATCH_WORKERS";
pub const ENV_MODE: &str = "SIMBATCH_MODE";

/// Reads a batch file. Unknown keys fail in `strict` mode and are logged otherwise;
/// `_`-prefixed and `x-` keys are always allowed so YAML anchors can live anywhere.
pub fn load_config(path: &Path, strict: bool) -> Result<BatchConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    parse_config(&raw, path, strict)
}

fn parse_config(raw: &str, path: &Path, strict: bool) -> Result<BatchConfig, ConfigError> {
    let mut ignored_keys = HashSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);
    let mut cfg: BatchConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML {}: {}", path.display(), e)))?;

    let mut unknown: Vec<_> = ignored_keys
        .iter()
        .filter(|k| {
            let leaf = k.rsplit('.').next().unwrap_or(k);
            !leaf.starts_with('_') && !leaf.starts_with("x-")
        })
        .cloned()
        .collect();
    unknown.sort();
    if !unknown.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "unknown fields in strict mode: {:?} (file: {})",
                unknown,
                path.display()
            )));
        }
        tracing::warn!(event = "config.unknown_fields", fields = ?unknown, file = %path.display());
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }
    validate(&cfg)?;

    let base = path.parent().unwrap_or(Path::new("."));
    normalize_paths(&mut cfg, base);
    Ok(cfg)
}

fn validate(cfg: &BatchConfig) -> Result<(), ConfigError> {
    if cfg.jobs.is_empty() {
        return Err(ConfigError("config has no jobs".into()));
    }
    let mut seen = BTreeSet::new();
    for job in &cfg.jobs {
        if !seen.insert(job.id.as_str()) {
            return Err(ConfigError(format!("duplicate job id '{}'", job.id)));
        }
        if job.source.trim().is_empty() {
            return Err(ConfigError(format!("job '{}' has an empty source", job.id)));
        }
    }
    if cfg.settings.workers == Some(0) {
        return Err(ConfigError("settings.workers must not be 0".into()));
    }
    Ok(())
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Relative paths are taken relative to the config file. A bare engine program name
/// (no separator) is left for `PATH` lookup.
fn normalize_paths(cfg: &mut BatchConfig, base: &Path) {
    cfg.sink = resolve(base, &cfg.sink);
    cfg.scratch_root = resolve(base, &cfg.scratch_root);
    for job in &mut cfg.jobs {
        job.source = resolve(base, Path::new(&job.source))
            .to_string_lossy()
            .into_owned();
    }
    if let Some(engine) = cfg.engine.as_mut() {
        if engine.program.components().count() > 1 {
            engine.program = resolve(base, &engine.program);
        }
    }
}

/// Applies `SIMBATCH_WORKERS` / `SIMBATCH_MODE` from the process environment.
pub fn apply_env_overrides(cfg: &mut BatchConfig) -> Result<(), ConfigError> {
    apply_overrides_from(cfg, |k| std::env::var(k).ok())
}

fn apply_overrides_from(
    cfg: &mut BatchConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(w) = lookup(ENV_WORKERS) {
        let n: i64 = w
            .trim()
            .parse()
            .map_err(|_| ConfigError(format!("{}='{}' is not an integer", ENV_WORKERS, w)))?;
        if n == 0 {
            return Err(ConfigError(format!("{} must not be 0", ENV_WORKERS)));
        }
        cfg.settings.workers = Some(n);
    }
    if let Some(m) = lookup(ENV_MODE) {
        cfg.settings.mode = m.parse().map_err(ConfigError)?;
    }
    Ok(())
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"version: 1
sink: results.db
scratch_root: .
engine:
  program: Models
  args: ["--verbose"]
  timeout_seconds: 600
  output_extension: db
settings:
  workers: -2
  mode: processes
  clear_sink: true
  retries: 3
  backoff_ms: 100
jobs:
  - id: 0
    source: models/maize.apsimx
    overrides:
      ".Simulations.Simulation.Field.Fertilise at sowing.Amount": 0
    metadata:
      Nitrogen: 0
  - id: 1
    source: models/maize.apsimx
    overrides:
      ".Simulations.Simulation.Field.Fertilise at sowing.Amount": 100
    metadata:
      Nitrogen: 100
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}

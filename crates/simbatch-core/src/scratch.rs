use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory-name suffix marking transient run areas.
pub const SCRATCH_SUFFIX: &str = "scratch";

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_BACKOFF: Duration = Duration::from_millis(100);

/// Removes every directory directly under `root` whose name ends in `scratch`.
///
/// Best effort: an entry that cannot be removed (a slow worker still holds a handle) is
/// logged and skipped so the rest still gets cleaned. Returns how many were removed.
pub fn clear_scratch(root: &Path) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(event = "scratch.scan_failed", root = %root.display(), error = %e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_scratch = path.is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(SCRATCH_SUFFIX));
        if !is_scratch {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(
                event = "scratch.remove_failed",
                path = %path.display(),
                error = %e
            ),
        }
    }
    tracing::debug!(event = "scratch.cleared", root = %root.display(), removed);
    removed
}

/// Deletes `path`, retrying a few times while the OS still holds it, then gives up
/// quietly. Returns whether the file is gone.
pub fn remove_file_with_retry(path: &Path) -> bool {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match std::fs::remove_file(path) {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) if attempt == REMOVE_ATTEMPTS => {
                tracing::warn!(
                    event = "scratch.file_locked",
                    path = %path.display(),
                    error = %e,
                    "leaving file behind"
                );
            }
            Err(_) => std::thread::sleep(REMOVE_BACKOFF * attempt),
        }
    }
    false
}

/// Deletes the directory tree at `path` with the same retry-then-give-up policy as
/// [`remove_file_with_retry`].
pub fn remove_dir_with_retry(path: &Path) -> bool {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match std::fs::remove_dir_all(path) {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) if attempt == REMOVE_ATTEMPTS => {
                tracing::warn!(
                    event = "scratch.remove_failed",
                    path = %path.display(),
                    error = %e,
                    "leaving directory behind"
                );
            }
            Err(_) => std::thread::sleep(REMOVE_BACKOFF * attempt),
        }
    }
    false
}

/// Owns one run's scratch directory and removes it when dropped, so cleanup happens on
/// success, on error returns and when the owning future is cancelled.
///
/// Only the guard's own directory is touched. Other runs sharing the same root keep
/// theirs; sweeping leftovers is an explicit [`clear_scratch`] call.
pub struct ScratchGuard {
    run_dir: PathBuf,
}

impl ScratchGuard {
    /// Creates `<root>/<run_id>_scratch` and returns a guard owning it.
    pub fn create(root: &Path, run_id: &str) -> std::io::Result<Self> {
        let run_dir = root.join(format!("{}_{}", run_id, SCRATCH_SUFFIX));
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let removed = remove_dir_with_retry(&self.run_dir);
        tracing::info!(event = "scratch.cleanup", run_dir = %self.run_dir.display(), removed);
    }
}

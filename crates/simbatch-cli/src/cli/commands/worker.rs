use super::exit_codes;
use simbatch_core::engine::serve_worker_request;

/// Child side of process mode. Job failures travel back in the outcome line, so the
/// exit code is only non-zero when no outcome could be produced at all.
pub fn run() -> anyhow::Result<i32> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match serve_worker_request(stdin.lock(), stdout.lock()) {
        Ok(outcome) => {
            tracing::debug!(
                event = "worker.done",
                job_id = %outcome.job_id(),
                success = outcome.is_success()
            );
            Ok(exit_codes::OK)
        }
        Err(e) => {
            eprintln!("worker error: {}", e);
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

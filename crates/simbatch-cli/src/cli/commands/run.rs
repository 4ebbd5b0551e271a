use super::exit_codes;
use crate::cli::args::RunArgs;
use crate::cli::progress::BarObserver;
use simbatch_core::config::{apply_env_overrides, load_config, Mode};
use simbatch_core::engine::TracingObserver;
use simbatch_core::report::{console::print_summary, json::write_summary_json};
use simbatch_core::{
    Dispatch, ExternalEngine, IfExists, ParallelRunner, ProgressObserver, RunError,
    WorkerCommand,
};
use std::sync::Arc;

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut cfg = match load_config(&args.config, args.strict) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    if let Err(e) = apply_env_overrides(&mut cfg) {
        eprintln!("config error: {}", e);
        return Ok(exit_codes::CONFIG_ERROR);
    }
    if let Some(w) = args.workers {
        cfg.settings.workers = Some(w);
    }
    if let Some(m) = &args.mode {
        cfg.settings.mode = match m.parse::<Mode>() {
            Ok(m) => m,
            Err(e) => {
                eprintln!("config error: {}", e);
                return Ok(exit_codes::CONFIG_ERROR);
            }
        };
    }
    let if_exists: IfExists = match args.if_exists.parse() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("config error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let Some(engine) = cfg.engine.clone() else {
        eprintln!("config error: {} has no `engine` section", args.config.display());
        return Ok(exit_codes::CONFIG_ERROR);
    };

    let mut options = cfg.run_options();
    if args.no_clear || args.skip_completed {
        options.clear_sink = false;
    }
    options.skip_completed |= args.skip_completed;
    options.fail_fast |= args.fail_fast;

    let dispatch = match cfg.settings.mode {
        Mode::Threads => Dispatch::Threads(Arc::new(ExternalEngine::new(engine))),
        Mode::Processes => Dispatch::Processes(WorkerCommand::current_exe(engine)?),
    };
    let observer: Arc<dyn ProgressObserver> = if args.no_progress {
        Arc::new(TracingObserver)
    } else {
        Arc::new(BarObserver::new(cfg.jobs.len()))
    };

    tracing::info!(
        event = "run.start",
        config = %args.config.display(),
        jobs = cfg.jobs.len(),
        mode = %cfg.settings.mode,
        workers = options.workers,
        sink = %cfg.sink.display()
    );

    let mut runner = ParallelRunner::new(cfg.result_sink()).with_observer(observer);
    let summary = match runner.run_all_jobs(cfg.jobs.clone(), dispatch, &options).await {
        Ok(s) => s,
        Err(e) => {
            for f in runner.failed_jobs() {
                eprintln!("❌ {:<12} {:<16} {}", f.job_id, f.kind, f.message);
            }
            eprintln!("run failed: {}", e);
            return Ok(match e {
                RunError::InvalidConcurrency(_) => exit_codes::CONFIG_ERROR,
                RunError::FailFast { .. } => exit_codes::JOBS_FAILED,
                _ => exit_codes::RUN_FAILED,
            });
        }
    };

    print_summary(&summary);
    if let Some(path) = &args.summary_json {
        write_summary_json(&summary, path)?;
    }
    if let Some(path) = &args.csv {
        let rows = runner.save_to_csv(path)?;
        eprintln!("wrote {} rows to {}", rows, path.display());
    }
    if let Some(path) = &args.sqlite {
        let rows = runner.save_to_sqlite(path, &args.table, if_exists)?;
        eprintln!("wrote {} rows to {}:{}", rows, path.display(), args.table);
    }

    if summary.failed.is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::JOBS_FAILED)
    }
}

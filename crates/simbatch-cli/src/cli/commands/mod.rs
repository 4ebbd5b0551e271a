use super::args::*;
use simbatch_core::config::{load_config, write_sample_config};
use simbatch_core::scratch::clear_scratch;
use simbatch_core::ResultSink;

pub mod results;
pub mod run;
pub mod worker;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const JOBS_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const RUN_FAILED: i32 = 3;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Init(args) => cmd_init(args),
        Command::Run(args) => run::run(args).await,
        Command::Worker => worker::run(),
        Command::Tables(args) => cmd_tables(args),
        Command::Results(args) => results::run(args),
        Command::Clear(args) => cmd_clear(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
        return Ok(exit_codes::OK);
    }
    if let Some(parent) = args.config.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_sample_config(&args.config)?;
    eprintln!("created {}", args.config.display());
    Ok(exit_codes::OK)
}

/// `--sink` wins; otherwise the batch file names the store.
pub(crate) fn open_sink(args: &SinkArgs) -> anyhow::Result<ResultSink> {
    if let Some(path) = &args.sink {
        return Ok(ResultSink::new(path));
    }
    let cfg = load_config(&args.config, false)
        .map_err(|e| anyhow::anyhow!("config error: {}", e))?;
    Ok(cfg.result_sink())
}

fn cmd_tables(args: SinkArgs) -> anyhow::Result<i32> {
    let sink = open_sink(&args)?;
    for name in sink.written_tables()? {
        println!("{}", name);
    }
    Ok(exit_codes::OK)
}

fn cmd_clear(args: ClearArgs) -> anyhow::Result<i32> {
    let sink = open_sink(&args.sink)?;
    sink.clear()?;
    eprintln!("cleared {}", sink.path().display());
    if args.scratch {
        let cfg = load_config(&args.sink.config, false)
            .map_err(|e| anyhow::anyhow!("config error: {}", e))?;
        let removed = clear_scratch(&cfg.scratch_root);
        eprintln!("removed {} scratch directories under {}", removed, cfg.scratch_root.display());
    }
    Ok(exit_codes::OK)
}

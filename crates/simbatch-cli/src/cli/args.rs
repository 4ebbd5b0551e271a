use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "simbatch",
    version,
    about = "Run batches of simulation jobs in parallel and collect their reports into SQLite"
)]
pub struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "SIMBATCH_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a sample batch file
    Init(InitArgs),
    /// Run every job of a batch file
    Run(RunArgs),
    /// Execute one job read from stdin (process mode child)
    #[command(hide = true)]
    Worker,
    /// List the data tables recorded in a result store
    Tables(SinkArgs),
    /// Print or export the consolidated results of a result store
    Results(ResultsArgs),
    /// Delete a result store
    Clear(ClearArgs),
    Version,
}

#[derive(clap::Args, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "simbatch.yaml")]
    pub config: PathBuf,
}

#[derive(clap::Args, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "simbatch.yaml")]
    pub config: PathBuf,

    /// Reject unknown keys in the batch file
    #[arg(long)]
    pub strict: bool,

    /// Worker count; negative values count back from the number of CPUs
    #[arg(long, allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// threads | processes
    #[arg(long)]
    pub mode: Option<String>,

    /// Keep results of earlier runs instead of clearing the store first
    #[arg(long)]
    pub no_clear: bool,

    /// Skip jobs that already have rows in the store (implies --no-clear)
    #[arg(long)]
    pub skip_completed: bool,

    /// Stop at the first failed job
    #[arg(long)]
    pub fail_fast: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Write the consolidated results to this CSV file
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Copy the consolidated results into this SQLite file
    #[arg(long)]
    pub sqlite: Option<PathBuf>,

    /// Table name for --sqlite
    #[arg(long, default_value = simbatch_core::manager::DEFAULT_EXPORT_TABLE)]
    pub table: String,

    /// fail | replace | append, for --sqlite
    #[arg(long, default_value = "fail")]
    pub if_exists: String,

    /// Write the run summary as JSON
    #[arg(long)]
    pub summary_json: Option<PathBuf>,
}

#[derive(clap::Args, Clone)]
pub struct SinkArgs {
    /// Result store path; defaults to the `sink` of --config
    #[arg(long)]
    pub sink: Option<PathBuf>,

    #[arg(long, default_value = "simbatch.yaml")]
    pub config: PathBuf,
}

#[derive(clap::Args, Clone)]
pub struct ClearArgs {
    #[command(flatten)]
    pub sink: SinkArgs,

    /// Also remove leftover `*scratch` directories under the batch's scratch root
    #[arg(long)]
    pub scratch: bool,
}

#[derive(clap::Args, Clone)]
pub struct ResultsArgs {
    #[command(flatten)]
    pub sink: SinkArgs,

    /// rows | columns
    #[arg(long, default_value = "rows")]
    pub axis: String,

    /// csv | json
    #[arg(long, default_value = "csv")]
    pub format: String,

    /// Output file; stdout when omitted
    #[arg(long)]
    pub out: Option<PathBuf>,
}

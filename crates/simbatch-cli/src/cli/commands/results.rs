use super::{exit_codes, open_sink};
use crate::cli::args::ResultsArgs;
use simbatch_core::storage::export::write_csv;
use simbatch_core::Axis;
use std::io::Write;

pub fn run(args: ResultsArgs) -> anyhow::Result<i32> {
    let axis: Axis = args.axis.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    if !matches!(args.format.as_str(), "csv" | "json") {
        anyhow::bail!("unknown format '{}' (csv|json)", args.format);
    }
    let sink = open_sink(&args.sink)?;
    let view = sink.consolidated_view(axis)?;
    if view.is_empty() {
        eprintln!("no results in {}", sink.path().display());
        return Ok(exit_codes::JOBS_FAILED);
    }

    let mut out: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    if args.format == "json" {
        serde_json::to_writer_pretty(&mut out, &view)?;
        writeln!(out)?;
    } else {
        write_csv(&view, out)?;
    }
    if let Some(path) = &args.out {
        eprintln!("wrote {} rows to {}", view.len(), path.display());
    }
    Ok(exit_codes::OK)
}

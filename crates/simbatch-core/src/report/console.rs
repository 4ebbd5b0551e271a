use crate::manager::RunSummary;
use std::fmt::Write;

const MESSAGE_WIDTH: usize = 160;

pub fn print_summary(summary: &RunSummary) {
    eprint!("{}", format_summary(summary));
}

pub fn format_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\nRan {} jobs in {:.1}s",
        summary.submitted,
        summary.elapsed.as_secs_f64()
    );

    for f in &summary.failed {
        let msg = if f.message.len() > MESSAGE_WIDTH {
            let mut end = MESSAGE_WIDTH;
            while !f.message.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &f.message[..end])
        } else {
            f.message.clone()
        };
        let _ = writeln!(out, "❌ {:<12} {:<16} {}", f.job_id, f.kind, msg);
    }

    if !summary.tables.is_empty() {
        let _ = writeln!(out, "\nTables:");
        for t in &summary.tables {
            let _ = writeln!(out, "  {}", t);
        }
    }

    let _ = writeln!(out, "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let _ = writeln!(
        out,
        "Summary: {} succeeded, {} failed, {} skipped, {} tables",
        summary.succeeded,
        summary.failed.len(),
        summary.skipped,
        summary.tables.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::model::JobFailure;
    use std::time::Duration;

    #[test]
    fn summary_lists_failures_and_counts() {
        let summary = RunSummary {
            submitted: 5,
            succeeded: 4,
            skipped: 1,
            failed: vec![JobFailure {
                job_id: "2".into(),
                kind: ErrorKind::InvalidOverride,
                message: "x".repeat(400),
            }],
            tables: vec!["__sim_table__abc".into()],
            elapsed: Duration::from_millis(1500),
        };
        let text = format_summary(&summary);
        assert!(text.contains("Ran 5 jobs in 1.5s"));
        assert!(text.contains("invalid_override"));
        assert!(text.contains("..."));
        assert!(text.contains("  __sim_table__abc"));
        assert!(text.contains("Summary: 4 succeeded, 1 failed, 1 skipped, 1 tables"));
    }
}

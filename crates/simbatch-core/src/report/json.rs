use crate::manager::RunSummary;
use std::path::Path;

/// Writes the run summary as pretty JSON, for CI artifacts.
pub fn write_summary_json(summary: &RunSummary, out: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let v = serde_json::json!({
        "submitted": summary.submitted,
        "succeeded": summary.succeeded,
        "skipped": summary.skipped,
        "failed": summary.failed,
        "tables": summary.tables,
        "elapsed_ms": summary.elapsed.as_millis() as u64,
    });
    std::fs::write(out, serde_json::to_string_pretty(&v)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_failures_with_kinds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("reports/summary.json");
        let summary = RunSummary {
            submitted: 1,
            failed: vec![crate::model::JobFailure {
                job_id: "7".into(),
                kind: crate::errors::ErrorKind::Timeout,
                message: "slow".into(),
            }],
            ..RunSummary::default()
        };
        write_summary_json(&summary, &out)?;
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out)?)?;
        assert_eq!(v["failed"][0]["job_id"], "7");
        assert_eq!(v["failed"][0]["kind"], "timeout");
        assert_eq!(v["elapsed_ms"], 0);
        Ok(())
    }
}

use crate::errors::SinkError;
use crate::model::ResultTable;
use crate::storage::sink::{quote_ident, table_columns};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Behaviour when the export target table already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Fail,
    Replace,
    Append,
}

impl FromStr for IfExists {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(IfExists::Fail),
            "replace" => Ok(IfExists::Replace),
            "append" => Ok(IfExists::Append),
            other => Err(format!("unknown if_exists mode '{}' (fail|replace|append)", other)),
        }
    }
}

/// Writes `view` into `table` of the SQLite file at `path`.
pub fn save_to_sqlite(
    view: &ResultTable,
    path: &Path,
    table: &str,
    if_exists: IfExists,
) -> Result<(), SinkError> {
    let sql = |e: rusqlite::Error| SinkError::sqlite(path, e);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
        }
    }
    let mut conn = Connection::open(path).map_err(sql)?;
    let tx = conn.transaction().map_err(sql)?;

    let existing = table_columns(&tx, table).map_err(sql)?;
    let create = if existing.is_empty() {
        true
    } else {
        match if_exists {
            IfExists::Fail => return Err(SinkError::TargetExists(table.to_string())),
            IfExists::Replace => {
                tx.execute(&format!("DROP TABLE {}", quote_ident(table)), [])
                    .map_err(sql)?;
                true
            }
            IfExists::Append => {
                let mut have = existing.clone();
                let mut want = view.columns.clone();
                have.sort();
                want.sort();
                if have != want {
                    return Err(SinkError::SchemaConflict {
                        table: table.to_string(),
                        existing,
                        incoming: view.columns.clone(),
                    });
                }
                false
            }
        }
    };

    if create {
        let cols = view
            .schema()
            .iter()
            .map(|(c, ty)| format!("{} {}", quote_ident(c), ty.sql()))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(&format!("CREATE TABLE {} ({})", quote_ident(table), cols), [])
            .map_err(sql)?;
    }

    {
        let cols = view
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=view.columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                cols,
                placeholders
            ))
            .map_err(sql)?;
        for row in &view.rows {
            stmt.execute(rusqlite::params_from_iter(row.iter()))
                .map_err(sql)?;
        }
    }
    tx.commit().map_err(sql)?;
    tracing::info!(
        event = "export.sqlite",
        path = %path.display(),
        table,
        rows = view.len()
    );
    Ok(())
}

pub fn save_to_csv(view: &ResultTable, path: &Path) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
        }
    }
    let file = std::fs::File::create(path).map_err(|e| SinkError::io(path, e))?;
    write_csv(view, file)?;
    tracing::info!(event = "export.csv", path = %path.display(), rows = view.len());
    Ok(())
}

/// Header row, then one record per row; nulls become empty fields.
pub fn write_csv(view: &ResultTable, out: impl std::io::Write) -> Result<(), SinkError> {
    let mut w = csv::Writer::from_writer(out);
    w.write_record(&view.columns)?;
    for row in &view.rows {
        w.write_record(row.iter().map(|c| c.to_string()))?;
    }
    w.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cell;
    use tempfile::tempdir;

    fn view() -> ResultTable {
        ResultTable {
            name: "consolidated".into(),
            columns: vec!["JobIndex".into(), "Yield".into()],
            rows: vec![
                vec![Cell::from("0"), Cell::Number(10.5)],
                vec![Cell::from("1"), Cell::Null],
            ],
        }
    }

    #[test]
    fn fail_mode_refuses_existing_table() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db = dir.path().join("copy.db");
        save_to_sqlite(&view(), &db, "results", IfExists::Replace)?;
        let err = save_to_sqlite(&view(), &db, "results", IfExists::Fail).unwrap_err();
        assert!(matches!(err, SinkError::TargetExists(_)));
        Ok(())
    }

    #[test]
    fn replace_and_append_row_counts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let db = dir.path().join("copy.db");
        save_to_sqlite(&view(), &db, "results", IfExists::Replace)?;
        save_to_sqlite(&view(), &db, "results", IfExists::Replace)?;
        save_to_sqlite(&view(), &db, "results", IfExists::Append)?;
        let conn = Connection::open(&db)?;
        let n: i64 = conn.query_row("SELECT count(*) FROM results", [], |r| r.get(0))?;
        assert_eq!(n, 4);
        Ok(())
    }

    #[test]
    fn csv_has_header_and_empty_nulls() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("out.csv");
        save_to_csv(&view(), &out)?;
        let text = std::fs::read_to_string(&out)?;
        assert_eq!(text, "JobIndex,Yield\n0,10.5\n1,\n");
        Ok(())
    }

    #[test]
    fn if_exists_parses() {
        assert_eq!("append".parse::<IfExists>().unwrap(), IfExists::Append);
        assert!("merge".parse::<IfExists>().is_err());
    }
}

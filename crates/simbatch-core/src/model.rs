use crate::errors::ErrorKind;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Column added to every stored row naming the job that produced it.
pub const JOB_INDEX_COLUMN: &str = "JobIndex";
/// Column added to every stored row naming the engine report table it came from.
pub const SOURCE_TABLE_COLUMN: &str = "SourceTable";
/// Column added to every stored row with the id of the process that ran the job.
pub const PROCESS_ID_COLUMN: &str = "ProcessID";

/// Identifier of one job within a batch. Integers and strings are both accepted in
/// config files; the canonical form is the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<usize> for JobId {
    fn from(n: usize) -> Self {
        JobId(n.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }
        Ok(match Raw::deserialize(d)? {
            Raw::Int(n) => JobId(n.to_string()),
            Raw::Str(s) => JobId(s),
        })
    }
}

/// One unit of simulation work. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    /// Path or identifier of the base model template.
    pub source: String,
    /// Parameter path -> value edits applied to a private copy of the model.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, serde_json::Value>,
    /// Constant columns attached to every output row of this job.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Cell>,
}

impl JobDescriptor {
    pub fn new(id: impl Into<JobId>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            overrides: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.overrides.insert(path.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Number(n) => write!(f, "{}", n),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Number(n)
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Number(n as f64)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl rusqlite::ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value, ValueRef};
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(Value::Null),
            Cell::Number(n) => ToSqlOutput::Owned(Value::Real(*n)),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl rusqlite::types::FromSql for Cell {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        use rusqlite::types::ValueRef;
        Ok(match value {
            ValueRef::Null => Cell::Null,
            ValueRef::Integer(i) => Cell::Number(i as f64),
            ValueRef::Real(r) => Cell::Number(r),
            ValueRef::Text(t) => Cell::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Cell::Text(hex::encode(b)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ColumnType {
    Real,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

/// Rows x named columns, tagged with the report table it was read from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultTable {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> anyhow::Result<()> {
        if row.len() != self.columns.len() {
            anyhow::bail!(
                "row has {} values but table '{}' has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            );
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Cell>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Sets `name` to `value` on every row, replacing an existing column of that name.
    pub fn set_constant(&mut self, name: &str, value: Cell) {
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            }
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
    }

    /// A column is REAL when it holds at least one value and every non-null value is a number.
    pub fn column_types(&self) -> Vec<ColumnType> {
        (0..self.columns.len())
            .map(|i| {
                let mut seen = false;
                for row in &self.rows {
                    match &row[i] {
                        Cell::Null => {}
                        Cell::Number(_) => seen = true,
                        Cell::Text(_) => return ColumnType::Text,
                    }
                }
                if seen {
                    ColumnType::Real
                } else {
                    ColumnType::Text
                }
            })
            .collect()
    }

    pub fn schema(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .cloned()
            .zip(self.column_types())
            .collect()
    }
}

/// What a worker reports back for one job. Serializable so process-mode children can
/// hand it across the process boundary instead of raw errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success {
        job_id: JobId,
        tables: Vec<String>,
        rows: usize,
        attempts: u32,
        duration_ms: u64,
    },
    Failure {
        job_id: JobId,
        kind: ErrorKind,
        message: String,
        attempts: u32,
    },
}

impl JobOutcome {
    pub fn failure(job_id: JobId, kind: ErrorKind, message: impl Into<String>) -> Self {
        JobOutcome::Failure {
            job_id,
            kind,
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            JobOutcome::Success { job_id, .. } | JobOutcome::Failure { job_id, .. } => job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

/// Failed job record kept on the runner after a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub kind: ErrorKind,
    pub message: String,
}

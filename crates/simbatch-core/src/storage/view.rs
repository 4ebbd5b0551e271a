use crate::errors::SinkError;
use crate::model::{Cell, ResultTable};
use serde::{Deserialize, Serialize};

/// Direction in which per-schema tables are joined into one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Stack rows; columns are the union in first-seen order.
    #[default]
    Rows,
    /// Place tables side by side, aligned by row position.
    Columns,
}

impl TryFrom<i64> for Axis {
    type Error = SinkError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Axis::Rows),
            1 => Ok(Axis::Columns),
            other => Err(SinkError::InvalidAxis(other)),
        }
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rows" | "0" => Ok(Axis::Rows),
            "columns" | "1" => Ok(Axis::Columns),
            other => Err(format!("unknown axis '{}' (rows|columns)", other)),
        }
    }
}

pub fn concat(frames: Vec<ResultTable>, axis: Axis) -> ResultTable {
    match axis {
        Axis::Rows => concat_rows(frames),
        Axis::Columns => concat_columns(frames),
    }
}

fn concat_rows(frames: Vec<ResultTable>) -> ResultTable {
    let mut columns: Vec<String> = Vec::new();
    for f in &frames {
        for c in &f.columns {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
    }

    let mut out = ResultTable::new("consolidated", columns);
    for f in frames {
        let mapping: Vec<usize> = f
            .columns
            .iter()
            .map(|c| out.columns.iter().position(|o| o == c).unwrap_or(0))
            .collect();
        for row in f.rows {
            let mut full = vec![Cell::Null; out.columns.len()];
            for (src, cell) in row.into_iter().enumerate() {
                full[mapping[src]] = cell;
            }
            out.rows.push(full);
        }
    }
    out
}

fn concat_columns(frames: Vec<ResultTable>) -> ResultTable {
    let height = frames.iter().map(|f| f.len()).max().unwrap_or(0);
    let columns = frames.iter().flat_map(|f| f.columns.clone()).collect();
    let mut out = ResultTable::new("consolidated", columns);
    out.rows = vec![Vec::new(); height];
    for f in frames {
        let width = f.columns.len();
        let mut rows = f.rows.into_iter();
        for slot in out.rows.iter_mut() {
            match rows.next() {
                Some(r) => slot.extend(r),
                None => slot.extend(std::iter::repeat(Cell::Null).take(width)),
            }
        }
    }
    out
}

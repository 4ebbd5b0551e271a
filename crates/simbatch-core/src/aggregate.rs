use crate::model::{Cell, ColumnType, ResultTable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reduction applied to every numeric column of a report before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Sum,
    Mean,
    Max,
    Min,
    Median,
    /// Sample standard deviation (n - 1).
    Std,
}

impl Aggregate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Mean => "mean",
            Aggregate::Max => "max",
            Aggregate::Min => "min",
            Aggregate::Median => "median",
            Aggregate::Std => "std",
        }
    }

    /// Collapses `table` to a single row holding the reduction of each numeric column.
    /// Text columns are dropped; a table without rows stays empty.
    pub fn apply(&self, table: &ResultTable) -> ResultTable {
        let numeric: Vec<(usize, &String)> = table
            .column_types()
            .into_iter()
            .zip(table.columns.iter())
            .enumerate()
            .filter(|(_, (ty, _))| *ty == ColumnType::Real)
            .map(|(i, (_, name))| (i, name))
            .collect();

        let mut out = ResultTable::new(
            table.name.clone(),
            numeric.iter().map(|(_, n)| (*n).clone()).collect(),
        );
        if table.is_empty() || numeric.is_empty() {
            return out;
        }

        let row = numeric
            .iter()
            .map(|(i, _)| {
                let values: Vec<f64> = table.rows.iter().filter_map(|r| r[*i].as_f64()).collect();
                self.reduce(values).map(Cell::Number).unwrap_or(Cell::Null)
            })
            .collect();
        out.rows.push(row);
        out
    }

    fn reduce(&self, mut values: Vec<f64>) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        match self {
            Aggregate::Sum => Some(values.iter().sum()),
            Aggregate::Mean => Some(values.iter().sum::<f64>() / n),
            Aggregate::Max => values.into_iter().reduce(f64::max),
            Aggregate::Min => values.into_iter().reduce(f64::min),
            Aggregate::Median => {
                values.sort_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    Some((values[mid - 1] + values[mid]) / 2.0)
                } else {
                    Some(values[mid])
                }
            }
            Aggregate::Std => {
                if values.len() < 2 {
                    return None;
                }
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                Some(var.sqrt())
            }
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Aggregate::Sum),
            "mean" => Ok(Aggregate::Mean),
            "max" => Ok(Aggregate::Max),
            "min" => Ok(Aggregate::Min),
            "median" => Ok(Aggregate::Median),
            "std" => Ok(Aggregate::Std),
            other => Err(format!(
                "unknown aggregate '{}' (sum|mean|max|min|median|std)",
                other
            )),
        }
    }
}

use sha2::{Digest, Sha256};

pub const DEFAULT_TABLE_PREFIX: &str = "__sim_table__";

/// Hex digest chars kept in derived table names.
const SCHEMA_ID_LEN: usize = 16;

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Deterministic identity of a column layout.
///
/// Only column names take part, sorted, so neither column order nor the values a job
/// happened to produce (an all-null column in one job, numbers in the next) split one
/// report across tables.
pub fn schema_id<S: AsRef<str>>(columns: &[S]) -> String {
    let mut names: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    names.sort_unstable();
    let digest = sha256_hex(&names.join("|"));
    digest[..SCHEMA_ID_LEN].to_string()
}

pub fn table_name<S: AsRef<str>>(prefix: &str, columns: &[S]) -> String {
    format!("{}{}", prefix, schema_id(columns))
}

use db::Row;
use schemars::JsonSchema;
use serde::Serialize;

/// Rows returned by `execute_query`, along with the SQL that actually ran.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct QueryOutput {
    pub query: String,
    pub row_count: usize,
    pub rows: Vec<Row>,
}

impl QueryOutput {
    pub fn new(query: String, rows: Vec<Row>) -> Self {
        Self {
            query,
            row_count: rows.len(),
            rows,
        }
    }
}

/// Appends `LIMIT {cap}` unless the statement already mentions `LIMIT` anywhere
/// (case-insensitive) or the cap is absent or zero. Trailing `;` and whitespace are
/// dropped first so the clause lands inside the statement.
pub fn apply_row_cap(sql: &str, cap: Option<u64>) -> String {
    match cap {
        Some(rows) if rows > 0 && !sql.to_uppercase().contains("LIMIT") => {
            let statement = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
            format!("{statement} LIMIT {rows}")
        }
        _ => sql.to_string(),
    }
}

/// A table reference as typed by a user: `project.dataset.table`, `dataset.table` or `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: String,
}

impl TableName {
    /// Splits on `.` without validating the parts. Anything that is not two or three
    /// parts long is read as a bare table name made of its first part.
    pub fn parse(text: &str) -> Self {
        let parts: Vec<&str> = text.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table] => Self {
                project: Some((*project).to_string()),
                dataset: Some((*dataset).to_string()),
                table: (*table).to_string(),
            },
            [dataset, table] => Self {
                project: None,
                dataset: Some((*dataset).to_string()),
                table: (*table).to_string(),
            },
            _ => Self {
                project: None,
                dataset: None,
                table: parts.first().copied().unwrap_or_default().to_string(),
            },
        }
    }
}

/// Dataset of the first configured table whose name contains `table`.
///
/// This is a substring match: `order` also hits `proj.sales.orders`, and when several
/// configured tables match, the first one in the list wins. A match without a dataset
/// part, or with an empty one, yields nothing.
pub fn infer_dataset(table: &str, configured: &[String]) -> Option<String> {
    configured
        .iter()
        .find(|candidate| candidate.contains(table))
        .and_then(|candidate| TableName::parse(candidate).dataset)
        .filter(|dataset| !dataset.is_empty())
}

pub mod bigquery;

mod auth;
mod rows;

pub use auth::Credentials;
pub use bigquery::BigQueryWarehouse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A result row, column name to JSON value, in column order.
pub type Row = Map<String, Value>;

/// Trait defining the warehouse operations the tools are built on
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Project used whenever a request does not name one
    fn default_project(&self) -> &str;

    /// Enumerate the datasets of the default project
    async fn list_datasets(&self) -> Result<Vec<DatasetRef>, WarehouseError>;

    /// Enumerate the tables of a dataset, in the order the warehouse reports them
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableSummary>, WarehouseError>;

    /// Fetch the metadata and schema of a single table
    async fn get_table(&self, table: &TableId) -> Result<TableMetadata, WarehouseError>;

    /// Run a SQL statement and wait for all of its rows
    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("no project configured, set GOOGLE_CLOUD_PROJECT or warehouse.project")]
    NoProject,
    #[error("could not obtain credentials: {0}")]
    Credentials(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid request URL: {0}")]
    Url(String),
    #[error("query job {job_id} failed: {message}")]
    Job { job_id: String, message: String },
    #[error("query job {0} did not complete in time")]
    Timeout(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetRef {
    pub project: String,
    pub dataset_id: String,
}

impl DatasetRef {
    pub fn new(project: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset_id: dataset_id.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.project, self.dataset_id)
    }
}

/// Address of a single table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableId {
    pub project: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset_id, self.table_id)
    }
}

/// One entry of a table listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub id: TableId,
    /// `TABLE`, `VIEW`, `EXTERNAL`, `MATERIALIZED_VIEW`, ...
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMetadata {
    pub id: TableId,
    /// Absent for views and external tables
    pub num_rows: Option<u64>,
    pub fields: Vec<Field>,
}

/// A column declaration. Records carry their sub-fields in `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "nullable")]
    pub mode: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

fn nullable() -> String {
    "NULLABLE".to_string()
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            mode: nullable(),
            description: None,
            fields: vec![],
        }
    }

    pub fn is_repeated(&self) -> bool {
        self.mode.eq_ignore_ascii_case("REPEATED")
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    /// Rows keyed by column name, columns in result order
    pub rows: Vec<Row>,
}

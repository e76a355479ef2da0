//! Warehouse inspection tools for a chat agent.
//!
//! Four operations are exposed: [`Toolbox::list_datasets`], [`Toolbox::list_tables`],
//! [`Toolbox::get_table_schema`] and [`Toolbox::execute_query`]. Each performs one
//! best-effort warehouse call. Failures come back as [`ToolError`], whose `Display`
//! text is meant to be shown to the model or the user as-is.
//! [`ToolRegistry`] makes them callable by name with JSON arguments, and
//! [`warehouse_agent`] binds them to an agent definition.

mod agent;
mod query;
mod registry;
mod table_name;

#[cfg(test)]
mod testing;

pub use agent::{AGENT_NAME, warehouse_agent};
pub use query::{QueryOutput, apply_row_cap};
pub use registry::{
    ExecuteQuery, ExecuteQueryArgs, GetTableSchema, GetTableSchemaArgs, ListDatasets,
    ListDatasetsArgs, ListTables, ListTablesArgs, ToolOutcome, ToolRegistry, WarehouseTool,
};
pub use table_name::{TableName, infer_dataset};

use std::sync::Arc;

use config::AgentConfig;
use db::{BigQueryWarehouse, DatasetRef, Field, TableId, TableMetadata, Warehouse, WarehouseError};
use schemars::JsonSchema;
use serde::Serialize;
use tracing::{debug, warn};

pub const CLIENT_UNAVAILABLE: &str = "BigQuery client not available. Set GOOGLE_CLOUD_PROJECT and \
     provide credentials (BIGQUERY_ACCESS_TOKEN, managed auth or an authenticated gcloud), then restart the agent.";
const CONFIGURED_TABLES_MESSAGE: &str =
    "These are your configured BigQuery tables. You can also explore other datasets.";
const NO_DATASETS: &str = "No datasets found in the current project.";

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{}", CLIENT_UNAVAILABLE)]
    ClientUnavailable,
    #[error(
        "Cannot determine dataset for table '{table}'. Please provide full table name \
         (project.dataset.table) or configure BIGQUERY_TABLES."
    )]
    UnresolvedDataset { table: String },
    #[error("Error listing datasets: {0}")]
    ListDatasets(#[source] WarehouseError),
    #[error("Error listing tables in dataset {dataset_id}: {source}")]
    ListTables {
        dataset_id: String,
        source: WarehouseError,
    },
    #[error("Error getting schema for {table_name}: {source}")]
    Schema {
        table_name: String,
        source: WarehouseError,
    },
    #[error("Error executing query: {0}")]
    Query(#[source] WarehouseError),
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("Could not describe tool {tool}: {message}")]
    Definition { tool: String, message: String },
    #[error("Could not encode the result of {tool}: {message}")]
    Encode { tool: String, message: String },
}

/// Either a payload or a plain notice such as "no tables found". Notices are not errors.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum Reply<T> {
    Data(T),
    Notice(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, JsonSchema)]
pub struct DatasetListing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured_tables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<DatasetEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct DatasetEntry {
    pub dataset_id: String,
    pub full_name: String,
}

impl From<&DatasetRef> for DatasetEntry {
    fn from(dataset: &DatasetRef) -> Self {
        Self {
            dataset_id: dataset.dataset_id.clone(),
            full_name: dataset.full_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct TableList {
    pub tables: Vec<TableEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct TableEntry {
    pub table_id: String,
    pub full_name: String,
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct TableSchema {
    /// `project.dataset.table`
    pub table: String,
    pub num_rows: Option<u64>,
    pub schema: Vec<FieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub mode: String,
    pub description: String,
    /// Sub-fields of a RECORD column
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldInfo>,
}

impl From<&Field> for FieldInfo {
    fn from(field: &Field) -> Self {
        Self {
            name: field.name.clone(),
            field_type: field.field_type.clone(),
            mode: field.mode.clone(),
            description: field.description.clone().unwrap_or_default(),
            fields: field.fields.iter().map(FieldInfo::from).collect(),
        }
    }
}

impl From<TableMetadata> for TableSchema {
    fn from(table: TableMetadata) -> Self {
        Self {
            table: table.id.full_name(),
            num_rows: table.num_rows,
            schema: table.fields.iter().map(FieldInfo::from).collect(),
        }
    }
}

/// Shared state of the tools: the warehouse client, if one could be set up, and the
/// read-only list of configured tables.
pub struct Toolbox {
    warehouse: Option<Arc<dyn Warehouse>>,
    configured_tables: Vec<String>,
    default_max_rows: u64,
}

impl Toolbox {
    pub fn new(warehouse: Option<Arc<dyn Warehouse>>, conf: &AgentConfig) -> Self {
        Self {
            warehouse,
            configured_tables: conf.warehouse.tables.clone(),
            default_max_rows: conf.warehouse.max_rows,
        }
    }

    /// Sets up the BigQuery client described by `conf`. When that is impossible the
    /// toolbox still works, and every tool answers with [`CLIENT_UNAVAILABLE`].
    pub fn connect(conf: &AgentConfig) -> Self {
        let warehouse = match BigQueryWarehouse::from_config(conf) {
            Ok(warehouse) => Some(Arc::new(warehouse) as Arc<dyn Warehouse>),
            Err(e) => {
                warn!("BigQuery client unavailable: {e}");
                None
            }
        };
        Self::new(warehouse, conf)
    }

    pub fn is_connected(&self) -> bool {
        self.warehouse.is_some()
    }

    pub fn configured_tables(&self) -> &[String] {
        &self.configured_tables
    }

    pub fn default_max_rows(&self) -> u64 {
        self.default_max_rows
    }

    fn warehouse(&self) -> Result<&dyn Warehouse, ToolError> {
        self.warehouse.as_deref().ok_or(ToolError::ClientUnavailable)
    }

    /// Configured tables and the datasets of the default project.
    pub async fn list_datasets(&self) -> Result<Reply<DatasetListing>, ToolError> {
        let warehouse = self.warehouse()?;
        let configured = &self.configured_tables;

        let mut listing = DatasetListing::default();
        if !configured.is_empty() {
            listing.configured_tables = Some(configured.clone());
            listing.message = Some(CONFIGURED_TABLES_MESSAGE.to_string());
        }

        match warehouse.list_datasets().await {
            Ok(datasets) => {
                if datasets.is_empty() && configured.is_empty() {
                    return Ok(Reply::Notice(NO_DATASETS.to_string()));
                }
                listing.datasets = Some(datasets.iter().map(DatasetEntry::from).collect());
                Ok(Reply::Data(listing))
            }
            // configured tables are still useful when enumeration fails
            Err(e) if !configured.is_empty() => {
                warn!("Listing datasets failed: {e}");
                Ok(Reply::Data(DatasetListing {
                    configured_tables: Some(configured.clone()),
                    error: Some(ToolError::ListDatasets(e).to_string()),
                    ..DatasetListing::default()
                }))
            }
            Err(e) => Err(ToolError::ListDatasets(e)),
        }
    }

    /// Tables of `dataset_id`, which is either a bare dataset of the default project or
    /// `project.dataset`.
    pub async fn list_tables(&self, dataset_id: &str) -> Result<Reply<TableList>, ToolError> {
        let warehouse = self.warehouse()?;
        let dataset = match dataset_id.split_once('.') {
            Some((project, dataset)) => DatasetRef::new(project, dataset),
            None => DatasetRef::new(warehouse.default_project(), dataset_id),
        };

        let tables = warehouse
            .list_tables(&dataset)
            .await
            .map_err(|source| ToolError::ListTables {
                dataset_id: dataset_id.to_string(),
                source,
            })?;

        if tables.is_empty() {
            return Ok(Reply::Notice(format!("No tables found in dataset {dataset_id}.")));
        }

        Ok(Reply::Data(TableList {
            tables: tables
                .into_iter()
                .map(|t| TableEntry {
                    full_name: t.id.full_name(),
                    table_id: t.id.table_id,
                    table_type: t.table_type,
                })
                .collect(),
        }))
    }

    /// Schema of a table named at any granularity. A missing project falls back to the
    /// client's default, a missing dataset to the configured tables.
    pub async fn get_table_schema(&self, table_name: &str) -> Result<TableSchema, ToolError> {
        let warehouse = self.warehouse()?;
        let name = TableName::parse(table_name);

        // empty parts, as in ".d.t" or "p..t", count as missing
        let project = name
            .project
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| warehouse.default_project().to_string());
        let dataset = match name.dataset.filter(|d| !d.is_empty()) {
            Some(dataset) => dataset,
            None => infer_dataset(&name.table, &self.configured_tables).ok_or_else(|| {
                ToolError::UnresolvedDataset {
                    table: name.table.clone(),
                }
            })?,
        };
        let id = TableId::new(project, dataset, name.table);
        debug!("Resolved {table_name} to {}", id.full_name());

        let table = warehouse
            .get_table(&id)
            .await
            .map_err(|source| ToolError::Schema {
                table_name: table_name.to_string(),
                source,
            })?;
        Ok(table.into())
    }

    /// Runs `sql`, capped at `max_rows` rows unless it already limits itself.
    pub async fn execute_query(
        &self,
        sql: &str,
        max_rows: Option<u64>,
    ) -> Result<QueryOutput, ToolError> {
        let warehouse = self.warehouse()?;
        let query = apply_row_cap(sql, max_rows);
        let result = warehouse.query(&query).await.map_err(ToolError::Query)?;
        Ok(QueryOutput::new(query, result.rows))
    }
}

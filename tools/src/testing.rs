use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use config::AgentConfig;
use db::{
    DatasetRef, Field, QueryResult, Row, TableId, TableMetadata, TableSummary, Warehouse,
    WarehouseError,
};
use serde_json::Value;

use crate::Toolbox;

/// In-memory warehouse that records what it was asked for.
#[derive(Default)]
pub(crate) struct FakeWarehouse {
    project: String,
    datasets: Vec<DatasetRef>,
    tables: HashMap<String, Vec<TableSummary>>,
    metadata: Vec<TableMetadata>,
    rows: Vec<Row>,
    failure: Option<String>,
    calls: AtomicUsize,
    last_query: Mutex<Option<String>>,
    last_table: Mutex<Option<TableId>>,
    last_dataset: Mutex<Option<DatasetRef>>,
}

impl FakeWarehouse {
    pub(crate) fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn with_datasets(mut self, ids: &[&str]) -> Self {
        self.datasets = ids
            .iter()
            .map(|id| DatasetRef::new(self.project.clone(), *id))
            .collect();
        self
    }

    pub(crate) fn with_tables(mut self, dataset: &str, tables: &[(&str, &str)]) -> Self {
        let summaries = tables
            .iter()
            .map(|(id, kind)| TableSummary {
                id: TableId::new(self.project.clone(), dataset, *id),
                table_type: (*kind).to_string(),
            })
            .collect();
        self.tables.insert(dataset.to_string(), summaries);
        self
    }

    pub(crate) fn with_table(mut self, table: TableMetadata) -> Self {
        self.metadata.push(table);
        self
    }

    pub(crate) fn with_rows(mut self, rows: Vec<Value>) -> Self {
        self.rows = rows
            .into_iter()
            .filter_map(|row| row.as_object().cloned())
            .collect();
        self
    }

    /// Every call fails with a 403 carrying `message`.
    pub(crate) fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_query(&self) -> Option<String> {
        self.last_query.lock().unwrap().clone()
    }

    pub(crate) fn last_table(&self) -> Option<TableId> {
        self.last_table.lock().unwrap().clone()
    }

    pub(crate) fn last_dataset(&self) -> Option<DatasetRef> {
        self.last_dataset.lock().unwrap().clone()
    }

    fn enter(&self) -> Result<(), WarehouseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(WarehouseError::Api {
                status: 403,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn not_found(what: String) -> WarehouseError {
    WarehouseError::Api {
        status: 404,
        message: format!("Not found: {what}"),
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    fn default_project(&self) -> &str {
        &self.project
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetRef>, WarehouseError> {
        self.enter()?;
        Ok(self.datasets.clone())
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableSummary>, WarehouseError> {
        *self.last_dataset.lock().unwrap() = Some(dataset.clone());
        self.enter()?;
        self.tables
            .get(&dataset.dataset_id)
            .cloned()
            .ok_or_else(|| not_found(format!("Dataset {}", dataset.full_name())))
    }

    async fn get_table(&self, table: &TableId) -> Result<TableMetadata, WarehouseError> {
        *self.last_table.lock().unwrap() = Some(table.clone());
        self.enter()?;
        self.metadata
            .iter()
            .find(|meta| &meta.id == table)
            .cloned()
            .ok_or_else(|| not_found(format!("Table {}", table.full_name())))
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        *self.last_query.lock().unwrap() = Some(sql.to_string());
        self.enter()?;
        Ok(QueryResult {
            rows: self.rows.clone(),
        })
    }
}

/// Two columns, 42 rows.
pub(crate) fn table(project: &str, dataset: &str, table: &str) -> TableMetadata {
    let mut id = Field::new("id", "INTEGER");
    id.mode = "REQUIRED".to_string();
    id.description = Some("primary key".to_string());

    TableMetadata {
        id: TableId::new(project, dataset, table),
        num_rows: Some(42),
        fields: vec![id, Field::new("note", "STRING")],
    }
}

fn config(tables: &[&str]) -> AgentConfig {
    let mut conf = AgentConfig::default();
    conf.warehouse.tables = tables.iter().map(ToString::to_string).collect();
    conf
}

pub(crate) fn toolbox(fake: FakeWarehouse, tables: &[&str]) -> (Toolbox, Arc<FakeWarehouse>) {
    let fake = Arc::new(fake);
    let tools = Toolbox::new(Some(fake.clone() as Arc<dyn Warehouse>), &config(tables));
    (tools, fake)
}

pub(crate) fn toolbox_without_client(tables: &[&str]) -> Toolbox {
    Toolbox::new(None, &config(tables))
}

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{DatasetListing, QueryOutput, Reply, TableList, TableSchema, ToolError, Toolbox};

/// What the agent gets back from a tool: a JSON payload or a message to show.
pub type ToolOutcome = Result<Value, String>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A typed tool over the [`Toolbox`]. Argument and output schemas are derived from the
/// associated types.
pub trait WarehouseTool: Send + Sync {
    type Args: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + JsonSchema + Send;

    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn call(
        &self,
        toolbox: &Toolbox,
        args: Self::Args,
    ) -> impl Future<Output = Result<Self::Output, ToolError>> + Send;
}

trait ToolDyn: Send + Sync {
    fn name(&self) -> &'static str;
    fn call<'a>(&'a self, toolbox: &'a Toolbox, args: Value) -> BoxFuture<'a, Result<Value, ToolError>>;
}

impl<T: WarehouseTool> ToolDyn for T {
    fn name(&self) -> &'static str {
        WarehouseTool::name(self)
    }

    fn call<'a>(&'a self, toolbox: &'a Toolbox, args: Value) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let tool = WarehouseTool::name(self);
            let args = serde_json::from_value::<T::Args>(args).map_err(|e| {
                ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    message: e.to_string(),
                }
            })?;
            let output = WarehouseTool::call(self, toolbox, args).await?;
            serde_json::to_value(output).map_err(|e| ToolError::Encode {
                tool: tool.to_string(),
                message: e.to_string(),
            })
        })
    }
}

struct RegisteredTool {
    definition: ai::Tool,
    output_schema: Value,
    handler: Box<dyn ToolDyn>,
}

/// Tools addressable by name, each with a typed handler and declared schemas.
pub struct ToolRegistry {
    toolbox: Arc<Toolbox>,
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new(toolbox: Arc<Toolbox>) -> Self {
        Self {
            toolbox,
            tools: vec![],
        }
    }

    /// Registry holding the four warehouse tools.
    pub fn warehouse(toolbox: Arc<Toolbox>) -> Result<Self, ToolError> {
        let mut registry = Self::new(toolbox);
        registry.register(ListDatasets)?;
        registry.register(ListTables)?;
        registry.register(GetTableSchema)?;
        registry.register(ExecuteQuery)?;
        Ok(registry)
    }

    pub fn register<T: WarehouseTool + 'static>(&mut self, tool: T) -> Result<(), ToolError> {
        let name = WarehouseTool::name(&tool);
        if self.tools.iter().any(|t| t.handler.name() == name) {
            return Err(ToolError::DuplicateTool(name.to_string()));
        }

        let definition_error = |message: String| ToolError::Definition {
            tool: name.to_string(),
            message,
        };
        let parameters = ai::parameters_from_schema(schema_value::<T::Args>())
            .map_err(|e| definition_error(e.to_string()))?;

        self.tools.push(RegisteredTool {
            definition: ai::create_tool(name, WarehouseTool::description(&tool), parameters),
            output_schema: schema_value::<T::Output>(),
            handler: Box::new(tool),
        });
        Ok(())
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.handler.name()).collect()
    }

    /// Tool definitions in registration order, ready to hand to the model.
    pub fn definitions(&self) -> Vec<ai::Tool> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn output_schema(&self, name: &str) -> Option<&Value> {
        self.find(name).map(|t| &t.output_schema)
    }

    fn find(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.handler.name() == name)
    }

    /// Calls a tool with the raw argument string the model produced.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> ToolOutcome {
        let args = if arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(arguments) {
                Ok(args) => args,
                Err(e) => {
                    return Err(ToolError::InvalidArguments {
                        tool: name.to_string(),
                        message: e.to_string(),
                    }
                    .to_string());
                }
            }
        };
        self.call(name, args).await
    }

    pub async fn call(&self, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.find(name) else {
            warn!("Model asked for unknown tool {name}");
            return Err(ToolError::UnknownTool(name.to_string()).to_string());
        };

        info!("Calling {name} with {args}");
        let outcome = tool.handler.call(&self.toolbox, args).await;
        if let Err(e) = &outcome {
            warn!("{name} failed: {e}");
        }
        outcome.map_err(|e| e.to_string())
    }
}

/// JSON schema of `T` without the meta keys models don't need.
fn schema_value<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

/// No arguments.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDatasetsArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTablesArgs {
    /// Dataset to inspect, either `dataset` or `project.dataset`
    pub dataset_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetTableSchemaArgs {
    /// `project.dataset.table`, `dataset.table` or just `table`
    pub table_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteQueryArgs {
    /// Standard SQL statement to run
    pub sql: String,
    /// Row cap appended as a LIMIT clause when the statement has none. Defaults to 1000;
    /// null or 0 disables it.
    #[serde(default, deserialize_with = "present")]
    #[schemars(with = "Option<u64>")]
    pub max_rows: Option<Option<u64>>,
}

/// Tells an explicit `null` apart from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy)]
pub struct ListDatasets;

impl WarehouseTool for ListDatasets {
    type Args = ListDatasetsArgs;
    type Output = Reply<DatasetListing>;

    fn name(&self) -> &'static str {
        "list_datasets"
    }

    fn description(&self) -> &'static str {
        "List the datasets in the current BigQuery project, together with any preconfigured tables."
    }

    async fn call(&self, toolbox: &Toolbox, _args: Self::Args) -> Result<Self::Output, ToolError> {
        toolbox.list_datasets().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListTables;

impl WarehouseTool for ListTables {
    type Args = ListTablesArgs;
    type Output = Reply<TableList>;

    fn name(&self) -> &'static str {
        "list_tables"
    }

    fn description(&self) -> &'static str {
        "List all tables in a specific dataset."
    }

    async fn call(&self, toolbox: &Toolbox, args: Self::Args) -> Result<Self::Output, ToolError> {
        toolbox.list_tables(&args.dataset_id).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GetTableSchema;

impl WarehouseTool for GetTableSchema {
    type Args = GetTableSchemaArgs;
    type Output = TableSchema;

    fn name(&self) -> &'static str {
        "get_table_schema"
    }

    fn description(&self) -> &'static str {
        "Get the schema of a table: column names, types, modes and descriptions, plus its row count. \
         The name can be project.dataset.table, dataset.table or just the table."
    }

    async fn call(&self, toolbox: &Toolbox, args: Self::Args) -> Result<Self::Output, ToolError> {
        toolbox.get_table_schema(&args.table_name).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteQuery;

impl WarehouseTool for ExecuteQuery {
    type Args = ExecuteQueryArgs;
    type Output = QueryOutput;

    fn name(&self) -> &'static str {
        "execute_query"
    }

    fn description(&self) -> &'static str {
        "Execute a SQL query against BigQuery and return the resulting rows."
    }

    async fn call(&self, toolbox: &Toolbox, args: Self::Args) -> Result<Self::Output, ToolError> {
        let max_rows = args.max_rows.unwrap_or(Some(toolbox.default_max_rows()));
        toolbox.execute_query(&args.sql, max_rows).await
    }
}

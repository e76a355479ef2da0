use std::fmt::Display;
use std::future::Future;

use mistralrs::{
    Model, RequestBuilder, Response, TextMessageRole, TextModelBuilder, TokenSource, ToolChoice,
};

// Re-export types that consumers will need to create and use tools
pub use mistralrs::{Function, Tool, ToolType};
pub use serde_json::{Value, json};
pub use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("couldn't load model {model}: {message}")]
    Model { model: String, message: String },
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("tool parameters must be a JSON object, got {0}")]
    Parameters(Value),
}

/// Information about a tool call from the model
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Represents a chunk in the streaming response
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Regular text content
    Text(String),
    /// A tool call request from the model
    ToolCall(ToolCallInfo),
}

/// Everything needed to stand up an agent: who it is, which model runs it,
/// how it should behave and which tools it may call.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    pub description: String,
    pub instruction: String,
    pub tools: Vec<Tool>,
}

impl AgentDefinition {
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.function.name.as_str()).collect()
    }
}

pub struct LLM {
    model: Model,
    history: Vec<(TextMessageRole, String)>,
    tools: Vec<Tool>,
}

impl LLM {
    /// Loads the agent's model and seeds the conversation with its instruction.
    /// `api_key` authenticates downloads from the model hub.
    pub async fn new(agent: &AgentDefinition, api_key: Option<&str>) -> Result<Self, AiError> {
        let mut builder =
            TextModelBuilder::new(agent.model.clone()).with_dtype(mistralrs::ModelDType::F16);
        if let Some(key) = api_key {
            builder = builder.with_token_source(TokenSource::Literal(key.to_string()));
        }
        let model = builder.build().await.map_err(|e| AiError::Model {
            model: agent.model.clone(),
            message: e.to_string(),
        })?;
        tracing::info!("Loaded {} for agent {}", agent.model, agent.name);

        let mut llm = LLM {
            model,
            history: vec![],
            tools: vec![],
        };
        llm.set_system_prompt(&agent.instruction);
        llm.set_tools(agent.tools.clone());
        Ok(llm)
    }

    /// Set all tools for the LLM, replacing any existing tools
    pub fn set_tools(&mut self, tools: Vec<Tool>) {
        self.tools = tools;
    }

    pub fn set_system_prompt(&mut self, prompt: impl Display) {
        self.history
            .push((TextMessageRole::System, prompt.to_string()));
    }

    pub async fn stream_completion<F, Fut>(
        &mut self,
        prompt: impl Display,
        on_chunk: F,
    ) -> Result<Vec<ToolCallInfo>, AiError>
    where
        F: FnMut(StreamChunk) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.history
            .push((TextMessageRole::User, prompt.to_string()));
        self.stream_turn(on_chunk).await
    }

    /// Records a tool result without asking the model for a reply yet.
    /// Once every call of a turn is answered, [`LLM::resume`] continues.
    pub fn push_tool_result(&mut self, tool_call_id: String, result: String) {
        self.history.push((
            TextMessageRole::Tool,
            serde_json::json!({
                "tool_call_id": tool_call_id,
                "content": result,
            })
            .to_string(),
        ));
    }

    /// Continue the conversation from the current history without adding a message
    pub async fn resume<F, Fut>(&mut self, on_chunk: F) -> Result<Vec<ToolCallInfo>, AiError>
    where
        F: FnMut(StreamChunk) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.stream_turn(on_chunk).await
    }

    fn request(&self) -> RequestBuilder {
        let request_builder = self
            .history
            .iter()
            .fold(RequestBuilder::new(), |builder, (role, content)| {
                builder.add_message(role.clone(), content.clone())
            });

        if self.tools.is_empty() {
            return request_builder;
        }
        request_builder
            .set_tools(self.tools.clone())
            .set_tool_choice(ToolChoice::Auto)
    }

    async fn stream_turn<F, Fut>(&mut self, mut on_chunk: F) -> Result<Vec<ToolCallInfo>, AiError>
    where
        F: FnMut(StreamChunk) -> Fut,
        Fut: Future<Output = ()>,
    {
        let request_builder = self.request();

        let mut stream = self
            .model
            .stream_chat_request(request_builder)
            .await
            .map_err(|e| AiError::Request(e.to_string()))?;

        let mut full_response = String::new();
        let mut tool_calls: Vec<ToolCallInfo> = vec![];

        while let Some(chunk) = stream.next().await {
            if let Response::Chunk(chunk_response) = chunk {
                if let Some(choice) = chunk_response.choices.first()
                    && let Some(content) = &choice.delta.content
                {
                    full_response.push_str(content);
                    on_chunk(StreamChunk::Text(content.clone())).await;
                }
                if let Some(choice) = chunk_response.choices.first()
                    && let Some(tool) = &choice.delta.tool_calls
                {
                    for call in tool {
                        let tool_call_info = ToolCallInfo {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            arguments: call.function.arguments.clone(),
                        };
                        tool_calls.push(tool_call_info.clone());
                        on_chunk(StreamChunk::ToolCall(tool_call_info)).await;
                    }
                }
            }
        }

        tracing::debug!(
            "Turn finished with {} characters and {} tool calls",
            full_response.len(),
            tool_calls.len()
        );
        self.history
            .push((TextMessageRole::Assistant, full_response));

        Ok(tool_calls)
    }
}

/// Helper function to create a tool with the given name, description, and parameters
///
/// # Example
/// ```rust
/// use ai::{create_tool, json, HashMap, Value, ToolType};
///
/// let parameters: HashMap<String, Value> = serde_json::from_value(json!({
///     "type": "object",
///     "properties": {
///         "sql": {
///             "type": "string",
///             "description": "The SQL query to execute",
///         },
///     },
///     "required": ["sql"],
/// })).unwrap();
///
/// let tool = create_tool(
///     "execute_query",
///     "Execute a SQL query against the warehouse",
///     parameters,
/// );
/// assert_eq!(tool.function.name, "execute_query");
/// ```
pub fn create_tool(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: HashMap<String, Value>,
) -> Tool {
    Tool {
        tp: ToolType::Function,
        function: Function {
            name: name.into(),
            description: Some(description.into()),
            parameters: Some(parameters),
        },
    }
}

/// Turns a JSON schema object into the parameter map [`create_tool`] expects.
pub fn parameters_from_schema(schema: Value) -> Result<HashMap<String, Value>, AiError> {
    match schema {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(AiError::Parameters(other)),
    }
}

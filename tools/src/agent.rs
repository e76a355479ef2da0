use std::fmt::Write;

use ai::AgentDefinition;
use config::AIConfig;

use crate::ToolRegistry;

pub const AGENT_NAME: &str = "bigquery_data_agent";

const DESCRIPTION: &str =
    "BigQuery data analysis agent that answers questions about data using SQL queries";

const INSTRUCTION: &str = r#"You are an expert data analyst with access to BigQuery datasets and tables.

You can:
- explore the available datasets and tables
- read table schemas and data types
- write and run SQL queries that answer questions about the data
- draw insights from query results
- explain queries and findings in clear, business-friendly language

When a question is about data:
1. Look at the available datasets and tables to see what data exists.
2. Inspect the relevant schemas to understand structure and relationships.
3. Write a SQL query that answers the question.
4. Run it and analyse the rows that come back.
5. Explain what you found.

Be thorough and explain your reasoning. If it is unclear which data the user means, ask a specific question before querying."#;

/// Binds the registry's tools to the BigQuery analyst agent.
pub fn warehouse_agent(registry: &ToolRegistry, ai: &AIConfig) -> AgentDefinition {
    let mut instruction = INSTRUCTION.to_string();
    let configured = registry.toolbox().configured_tables();
    if !configured.is_empty() {
        instruction.push_str("\n\nThe user configured these tables, start with them:\n");
        for table in configured {
            let _ = writeln!(instruction, "- {table}");
        }
    }

    AgentDefinition {
        name: AGENT_NAME.to_string(),
        model: ai.model.clone(),
        description: DESCRIPTION.to_string(),
        instruction,
        tools: registry.definitions(),
    }
}

use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use serde_json::Value;
use tools::ToolOutcome;

const MAX_PREVIEW_ROWS: usize = 20;
const MAX_PREVIEW_CHARS: usize = 400;

/// Text handed back to the model for a tool outcome. Errors and notices go as plain text.
pub fn tool_result_text(outcome: &ToolOutcome) -> String {
    match outcome {
        Ok(Value::String(notice)) => notice.clone(),
        Ok(value) => value.to_string(),
        Err(message) => message.clone(),
    }
}

/// What the user sees of a tool call while the model works.
pub fn print_tool_outcome(name: &str, outcome: &ToolOutcome) {
    println!("\n{}", format!("[{name}]").yellow());
    match outcome {
        Err(message) => println!("{}", message.red()),
        Ok(value) => match rows_table(value) {
            Some(table) => {
                println!("{table}");
                if let Some(count) = value["row_count"].as_u64()
                    && usize::try_from(count).is_ok_and(|count| count > MAX_PREVIEW_ROWS)
                {
                    println!("{}", format!("... {count} rows in total").dimmed());
                }
            }
            None => println!("{}", preview(&tool_result_text(outcome)).dimmed()),
        },
    }
}

/// Renders `{"rows": [{..}, ..]}` payloads as a table, columns taken from the first row.
pub fn rows_table(value: &Value) -> Option<Table> {
    let rows = value.get("rows")?.as_array()?;
    let first = rows.first()?.as_object()?;
    let headers: Vec<String> = first.keys().cloned().collect();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(headers.clone());
    for row in rows.iter().take(MAX_PREVIEW_ROWS) {
        table.add_row(
            headers
                .iter()
                .map(|column| cell(row.get(column)))
                .collect::<Vec<_>>(),
        );
    }
    Some(table)
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= MAX_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
    format!("{cut}...")
}

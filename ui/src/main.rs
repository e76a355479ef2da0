mod render;

use std::io::{self, Write};
use std::sync::Arc;

use ai::{LLM, StreamChunk, ToolCallInfo};
use colored::Colorize;
use tools::{ToolRegistry, Toolbox, warehouse_agent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let conf = config::AgentConfig::load();

    let toolbox = Toolbox::connect(&conf);
    if !toolbox.is_connected() {
        eprintln!("{}", tools::CLIENT_UNAVAILABLE.yellow());
    }
    let registry = ToolRegistry::warehouse(Arc::new(toolbox))?;
    let agent = warehouse_agent(&registry, &conf.ai);

    println!("Loading {}...", agent.model);
    let mut llm = LLM::new(&agent, conf.api_key.as_deref()).await?;
    println!("Done! Ask {} about your data.", agent.name);

    while let Ok(prompt) = inquire::Text::new("You: ").prompt() {
        if prompt.trim().is_empty() {
            continue;
        }
        print!("\n{}", "[Assistant] ".blue());

        let mut turn = llm.stream_completion(prompt, print_chunk).await;
        let mut rounds = 0;
        loop {
            let calls = match turn {
                Ok(calls) if calls.is_empty() => break,
                Ok(calls) => calls,
                Err(err) => {
                    eprintln!("{err}");
                    break;
                }
            };

            rounds += 1;
            if rounds > conf.ai.max_tool_rounds {
                eprintln!(
                    "{}",
                    format!("Stopped after {} rounds of tool calls.", conf.ai.max_tool_rounds)
                        .red()
                );
                break;
            }

            answer_tool_calls(&mut llm, &registry, &calls).await;
            print!("\n{}", "[Assistant] ".blue());
            turn = llm.resume(print_chunk).await;
        }

        println!("\n");
    }

    Ok(())
}

async fn answer_tool_calls(llm: &mut LLM, registry: &ToolRegistry, calls: &[ToolCallInfo]) {
    for call in calls {
        let outcome = registry.dispatch(&call.name, &call.arguments).await;
        render::print_tool_outcome(&call.name, &outcome);
        llm.push_tool_result(call.id.clone(), render::tool_result_text(&outcome));
    }
}

async fn print_chunk(chunk: StreamChunk) {
    if let StreamChunk::Text(text) = chunk {
        print!("{}", text.blue());
        let _ = io::stdout().flush();
    }
}

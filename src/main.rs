use clap::{Parser, Subcommand};
use config::AgentConfig;
use tracing_subscriber::EnvFilter;

/// Configure the BigQuery chat agent.
#[derive(Debug, Parser)]
#[command(name = "bq-agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store the API key and the tables to work with
    Setup {
        /// Model hub API key
        #[arg(long)]
        api_key: String,
        /// Fully qualified table (project.dataset.table); repeat or comma separate
        #[arg(long = "table", value_delimiter = ',')]
        tables: Vec<String>,
        /// Default BigQuery project
        #[arg(long)]
        project: Option<String>,
    },
    /// Store the API key and a single table
    QuickSetup {
        #[arg(long)]
        api_key: String,
        /// Fully qualified table (project.dataset.table)
        table: String,
    },
    /// Print the current configuration, environment overrides included
    Show,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Setup {
            api_key,
            tables,
            project,
        } => {
            let mut conf = AgentConfig::get_or_default().setup(api_key, &tables);
            if project.is_some() {
                conf.warehouse.project = project;
            }
            save(&conf)?;
        }
        Command::QuickSetup { api_key, table } => {
            let conf = AgentConfig::get_or_default().quick_setup_single_table(api_key, &table);
            save(&conf)?;
            println!("Quick setup complete for table: {table}");
        }
        Command::Show => {
            let summary = AgentConfig::load().summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn save(conf: &AgentConfig) -> anyhow::Result<()> {
    let path = conf.save()?;
    tracing::info!("Wrote {}", path.display());

    println!("Configuration saved to {}", path.display());
    println!("  - API key configured");
    if conf.warehouse.tables.is_empty() {
        println!("  - BigQuery tables: none specified (will explore all available)");
    } else {
        println!("  - BigQuery tables: {}", conf.warehouse.tables.join(", "));
    }
    println!();
    println!("To export it to the current shell:");
    for (key, value) in conf.env_exports() {
        println!("  export {key}={value:?}");
    }
    println!();
    println!("Start chatting with: cargo run -p ui");
    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use route_cache::config::{load_config, AppConfig};
use route_cache::{HandlerCatalog, Pipeline};

#[derive(Parser)]
#[command(name = "route-cli")]
#[command(about = "Inspect route-cache configuration offline", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Print the compiled handler matcher
    Compile,
    /// Show the handler and merged route rules for a request
    Match {
        /// HTTP method, e.g. GET
        method: String,
        /// Request path, e.g. /api/users/42
        path: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let catalog = HandlerCatalog::with_builtins();
    let config = match &cli.config {
        Some(path) => load_config(path, &catalog)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Validate => {
            println!(
                "Configuration OK: {} handlers, {} route rules",
                config.handlers.len(),
                config.route_rules.len()
            );
        }
        Commands::Compile => {
            let pipeline = Pipeline::from_config(&config, &catalog)?;
            print!("{}", pipeline.compiled_source());
        }
        Commands::Match { method, path } => {
            let pipeline = Pipeline::from_config(&config, &catalog)?;
            let handler = pipeline
                .match_handler(&method.to_uppercase(), &path)
                .map(|m| {
                    json!({
                        "route": m.pattern,
                        "method": m.method,
                        "params": m.params,
                        "lazy": m.payload.is_lazy(),
                    })
                })
                .unwrap_or(Value::Null);
            let output = json!({
                "handler": handler,
                "rules": pipeline.resolve_rules(&path),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

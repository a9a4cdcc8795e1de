mod config;
mod docker;
mod error;
mod exec;
mod ops;
mod reaper;
mod session;
mod shared;
#[cfg(test)]
mod testutil;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use config::Config;
use docker::{DockerClient, DockerRuntime};
use error::SandboxError;
use ops::Dispatcher;
use session::SessionManager;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(about = "Docker-backed code-execution gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: operations as JSON lines on stdin, envelopes on stdout
    Serve,

    /// Print the supported operation names
    Operations,
}

/// One frontend request: `{"op": "...", "args": {...}}`.
#[derive(Deserialize)]
struct OpRequest {
    op: String,
    #[serde(default)]
    args: Option<Value>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let _log_guards = shared::logging::init("./logs", &config.log_level)?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Operations => {
            for op in ops::OPERATIONS {
                println!("{op}");
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let client = DockerClient::connect(config.docker_host.as_deref()).await?;
    let runtime = Arc::new(DockerRuntime::new(client));
    let manager = Arc::new(SessionManager::new(config, runtime));

    let _reaper = reaper::spawn(Arc::clone(&manager));
    let dispatcher = Dispatcher::new(manager);

    info!("gateway ready, reading operations from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<OpRequest>(line) {
            Ok(request) => {
                let args = request.args.unwrap_or_else(|| json!({}));
                dispatcher.dispatch(&request.op, args).await
            }
            Err(e) => {
                SandboxError::invalid_argument(format!("malformed request: {e}")).envelope()
            }
        };

        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        stdout.write_all(&body).await?;
        stdout.flush().await?;
    }

    info!("stdin closed, shutting down");
    Ok(())
}

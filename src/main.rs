use std::collections::HashMap;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use aws_mutation_gate_mcp::error::Result;
use aws_mutation_gate_mcp::mcp_server::AwsMcpServer;
use aws_mutation_gate_mcp::mode::{ModeFlags, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "aws-mutation-gate-mcp", version, about = "MCP server for AWS CLI operations that only mutates resources it created")]
struct Cli {
    #[command(flatten)]
    mode: ModeFlags,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP stream, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aws_mutation_gate_mcp=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();
    let config = match ServerConfig::from_startup(&cli.mode, &env) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Refusing to start: {}", e);
            std::process::exit(2);
        }
    };

    tracing::info!(
        mode = %config.mode,
        tag = %config.marker.stamp().value,
        "Starting aws_mutation_gate MCP server..."
    );

    let mut server = AwsMcpServer::new(config);

    if let Err(e) = server.run().await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

use anyhow::Result;
use clap::Parser;
use portal_gateway::tunnel::client::{AgentConfig, TunnelClient};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portal-agent", about = "Reverse-tunnel agent")]
struct Cli {
    /// Path to agent config file (.toml or .json)
    #[arg(short, long, default_value = "agent.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = AgentConfig::load(&cli.config)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let client = TunnelClient::new(config);
        let shutdown = client.shutdown_handle();

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("agent: received SIGINT, shutting down");
            shutdown.notify_waiters();
        });

        client.run().await;
        Ok(())
    })
}

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use file_relay_chat::{
    cli::{Cli, Command},
    client,
    config::{ClientConfig, ServerConfig},
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so the client's stdout carries only chat output.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = ServerConfig::from(args);
            let server = Server::bind(&config).await?;
            info!(
                "relay listening on text {} file {}",
                server.text_addr()?,
                server.file_addr()?
            );
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(ClientConfig::from(args)).await?,
    }

    Ok(())
}

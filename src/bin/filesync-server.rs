use anyhow::Result;
use clap::Parser;
use filesync::config::ServerConfig;
use tracing_subscriber::EnvFilter;

/// Sync server: lets clients synchronize folder contents through one
/// shared server folder.
#[derive(Debug, Parser)]
#[command(
    name = "filesync-server",
    version,
    after_help = "Environment variables:\n  \
        SERVER_PORT     port to listen on. Debug value: 8080\n  \
        SERVER_FOLDER   folder used for syncing, must exist. Debug value: mounted-server-folder\n  \
        API_KEY         key clients must present. Debug value: SUPER-SECRET-API-KEY\n  \
        CHUNK_SIZE      chunk size in bytes for file parts. Debug value: 10000000"
)]
struct Cli {
    /// Fill in a dummy default for every env var that is not set
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::from_env(cli.debug)?;
    filesync::server::run_server(config).await
}

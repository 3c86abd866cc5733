use anyhow::Result;
use clap::Parser;
use filesync::config::ClientConfig;
use tracing_subscriber::EnvFilter;

/// Sync client: connects to a server to share one folder with all
/// connected clients.
#[derive(Debug, Parser)]
#[command(
    name = "filesync",
    version,
    after_help = "Environment variables:\n  \
        SERVER_HOST     server hostname. Debug value: localhost\n  \
        SERVER_PORT     server port. Debug value: 8080\n  \
        CLIENT_FOLDER   folder to sync, must exist. Debug value: mounted-client-folder\n  \
        API_KEY         key for authentication with the server. Debug value: SUPER-SECRET-API-KEY\n  \
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
    let config = ClientConfig::from_env(cli.debug)?;
    filesync::transport::run_client(config).await
}

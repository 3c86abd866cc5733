//! Client transport: connects to the sync server and runs one session.
//!
//! One reader task feeds raw socket bytes through the frame decoder and
//! forwards whole frames over a channel; the engine task processes them in
//! order and owns the write half. Decoupling the two keeps the engine
//! testable without a socket.

use crate::config::ClientConfig;
use crate::engine::{spawn_frame_reader, EngineConfig, SyncEngine};
use crate::scanner;
use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Connect, handshake, and run the sync session until the peer closes the
/// connection or the socket drops. There is no retry: a transport failure
/// ends the session, and a fresh connection starts over with a fresh INIT.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let known_files = scanner::scan(&config.root)?;
    tracing::info!(files = ?known_files, "client started with local manifest");

    let addr = format!("{}:{}", config.host, config.port);
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    tracing::info!(%addr, "connected to sync server");

    let (read_half, mut write_half) = stream.into_split();

    let engine = SyncEngine::new(
        EngineConfig {
            root: config.root.clone(),
            chunk_size: config.chunk_size,
        },
        known_files,
    );
    engine.handshake(&config.api_key, &mut write_half).await?;

    let frames = spawn_frame_reader(read_half);
    let known_files = engine.run(frames, &mut write_half).await?;

    let _ = write_half.shutdown().await;
    tracing::info!(files = known_files.len(), "session ended");
    Ok(())
}

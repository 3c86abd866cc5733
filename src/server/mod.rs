//! Sync server: accepts any number of clients and keeps the server folder
//! and all connected client folders converged.
//!
//! Per connection: raw API-key check, then the same frame loop the client
//! runs. On a client's INIT manifest the server streams back every file
//! the client lacks and requests (via one INIT frame) every file it lacks
//! itself. A file fully received from one client is re-streamed to every
//! other connected client through that connection's own command queue, so
//! each wire keeps its one-transfer-at-a-time guarantee.

use crate::config::ServerConfig;
use crate::engine::{spawn_frame_reader, Control, OutboundQueue};
use crate::protocol::{encode_frame, encode_manifest, parse_manifest, Frame, Opcode};
use crate::scanner;
use crate::writer::IncomingWriter;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// How long a freshly accepted socket gets to present its API key.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Files to stream to one client, queued by other connections.
type BroadcastQueue = mpsc::UnboundedSender<Vec<String>>;

/// State shared by every connection.
struct SharedState {
    /// Files present in the server folder.
    files: Vec<String>,
    /// Paths currently being received from some client. A second client
    /// announcing one of these would interleave into the same destination.
    receiving: HashSet<String>,
    /// Per-connection broadcast queues, keyed by client id.
    peers: HashMap<u64, BroadcastQueue>,
}

/// Run the server until the process is stopped.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    serve_listener(listener, config).await
}

/// Accept loop over an already-bound listener, so tests can serve on an
/// ephemeral port.
pub async fn serve_listener(listener: TcpListener, config: ServerConfig) -> Result<()> {
    let files = scanner::scan(&config.root)?;
    tracing::info!(files = ?files, "server started with local manifest");

    let state = Arc::new(Mutex::new(SharedState {
        files,
        receiving: HashSet::new(),
        peers: HashMap::new(),
    }));

    tracing::info!(addr = %listener.local_addr()?, "listening for sync clients");

    let mut next_id = 0u64;
    loop {
        let (socket, addr) = listener.accept().await.context("accept failed")?;
        let client_id = next_id;
        next_id += 1;
        tracing::info!(client_id, %addr, "client connected");

        let config = config.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, client_id, config, state).await {
                tracing::warn!(client_id, "client session failed: {:#}", e);
            }
        });
    }
}

async fn handle_client(
    mut socket: TcpStream,
    client_id: u64,
    config: ServerConfig,
    state: Arc<Mutex<SharedState>>,
) -> Result<()> {
    if !authenticate(&mut socket, &config.api_key).await? {
        tracing::warn!(client_id, "invalid API key, dropping connection");
        return Ok(());
    }
    tracing::info!(client_id, "API key validated");

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    state
        .lock()
        .expect("shared state poisoned")
        .peers
        .insert(client_id, queue_tx);

    let result = client_loop(socket, client_id, &config, &state, queue_rx).await;

    state
        .lock()
        .expect("shared state poisoned")
        .peers
        .remove(&client_id);
    tracing::info!(client_id, "client closed");
    result
}

/// Read exactly the key's length and compare. Anything else, including a
/// timeout, rejects the connection.
async fn authenticate(socket: &mut TcpStream, api_key: &str) -> Result<bool> {
    let mut presented = vec![0u8; api_key.len()];
    let read = tokio::time::timeout(AUTH_TIMEOUT, socket.read_exact(&mut presented)).await;
    match read {
        Ok(Ok(_)) => Ok(presented == api_key.as_bytes()),
        Ok(Err(e)) => Err(e).context("failed to read API key"),
        Err(_) => Ok(false),
    }
}

async fn client_loop(
    socket: TcpStream,
    client_id: u64,
    config: &ServerConfig,
    state: &Arc<Mutex<SharedState>>,
    mut queue_rx: mpsc::UnboundedReceiver<Vec<String>>,
) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut frames = spawn_frame_reader(read_half);
    let mut writer = IncomingWriter::new(config.root.clone());
    let mut outbound = OutboundQueue::new(config.root.clone(), config.chunk_size);
    // Path currently being received from this client, mirrored into the
    // shared `receiving` set.
    let mut receiving_path: Option<String> = None;

    let result = 'session: loop {
        // Handle every decoded frame and queued broadcast before the next
        // write, so bulk sends never stop this client's own uploads from
        // being consumed.
        loop {
            match frames.try_recv() {
                Ok(frame) => {
                    match handle_frame(
                        frame,
                        client_id,
                        state,
                        &mut writer,
                        &mut receiving_path,
                        &mut outbound,
                        &mut write_half,
                    )
                    .await
                    {
                        Ok(Control::Continue) => {}
                        Ok(Control::Close) => break 'session Ok(()),
                        Err(e) => break 'session Err(e),
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'session Ok(()),
            }
        }
        while let Ok(paths) = queue_rx.try_recv() {
            outbound.push(paths);
        }

        if !outbound.is_idle() {
            if let Err(e) = outbound.step(&mut write_half).await {
                break 'session Err(e);
            }
        } else {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break 'session Ok(()) };
                    match handle_frame(
                        frame,
                        client_id,
                        state,
                        &mut writer,
                        &mut receiving_path,
                        &mut outbound,
                        &mut write_half,
                    ).await {
                        Ok(Control::Continue) => {}
                        Ok(Control::Close) => break 'session Ok(()),
                        Err(e) => break 'session Err(e),
                    }
                }
                paths = queue_rx.recv() => {
                    // Queued by another connection that finished receiving
                    // new files; stream them to this client.
                    let Some(paths) = paths else { break 'session Ok(()) };
                    outbound.push(paths);
                }
            }
        }
    };

    if let Some(path) = receiving_path.take() {
        state
            .lock()
            .expect("shared state poisoned")
            .receiving
            .remove(&path);
    }
    // Best effort: tell the peer we are done before dropping the socket.
    let _ = write_half.write_all(&encode_frame(Opcode::Close, b"")).await;
    let _ = write_half.shutdown().await;
    result
}

async fn handle_frame<W>(
    frame: Frame,
    client_id: u64,
    state: &Arc<Mutex<SharedState>>,
    writer: &mut IncomingWriter,
    receiving_path: &mut Option<String>,
    outbound: &mut OutboundQueue,
    write_half: &mut W,
) -> Result<Control>
where
    W: AsyncWrite + Unpin,
{
    match Opcode::from_u8(frame.opcode) {
        Some(Opcode::Init) => {
            let client_files: HashSet<String> =
                parse_manifest(&frame.payload)?.into_iter().collect();
            tracing::info!(client_id, files = client_files.len(), "client init received");

            let (missing_on_client, missing_on_server) = {
                let state = state.lock().expect("shared state poisoned");
                let missing_on_client: Vec<String> = state
                    .files
                    .iter()
                    .filter(|p| !client_files.contains(*p))
                    .cloned()
                    .collect();
                let missing_on_server: Vec<String> = client_files
                    .iter()
                    .filter(|p| !state.files.contains(*p))
                    .cloned()
                    .collect();
                (missing_on_client, missing_on_server)
            };

            if !missing_on_server.is_empty() {
                tracing::info!(client_id, files = ?missing_on_server, "requesting files from client");
                write_half
                    .write_all(&encode_frame(
                        Opcode::Init,
                        &encode_manifest(&missing_on_server),
                    ))
                    .await?;
                write_half.flush().await?;
            }

            if !missing_on_client.is_empty() {
                tracing::info!(client_id, files = ?missing_on_client, "sending files to client");
                outbound.push(missing_on_client);
            }
        }
        Some(Opcode::NewFilePath) => {
            let path = String::from_utf8(frame.payload.to_vec())
                .map_err(|e| anyhow::anyhow!("invalid UTF-8 in file path: {}", e))?;
            {
                let mut state = state.lock().expect("shared state poisoned");
                if state.files.contains(&path) || state.receiving.contains(&path) {
                    tracing::warn!(client_id, %path, "file collision, closing client");
                    return Ok(Control::Close);
                }
                state.receiving.insert(path.clone());
            }
            tracing::info!(client_id, %path, "starting to receive file");
            *receiving_path = Some(path.clone());
            writer.announce(path);
        }
        Some(Opcode::NewFilePart) => {
            writer.append(&frame.payload).await?;
        }
        Some(Opcode::NewFileEnd) => {
            let path = String::from_utf8(frame.payload.to_vec())
                .map_err(|e| anyhow::anyhow!("invalid UTF-8 in file path: {}", e))?;
            let finished = writer.finalize(&path).await?;

            let mut state = state.lock().expect("shared state poisoned");
            if let Some(pending) = receiving_path.take() {
                state.receiving.remove(&pending);
            }
            if finished {
                tracing::info!(client_id, %path, "fully received file");
                state.files.push(path.clone());
                // Fan the new file out to every other connected client.
                for (peer_id, queue) in &state.peers {
                    if *peer_id != client_id {
                        let _ = queue.send(vec![path.clone()]);
                    }
                }
            }
        }
        Some(Opcode::Close) | None => {
            tracing::info!(client_id, opcode = frame.opcode, "close requested");
            return Ok(Control::Close);
        }
    }
    Ok(Control::Continue)
}

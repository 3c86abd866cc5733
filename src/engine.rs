//! Sync engine: the connection-lifetime state machine.
//!
//! Owns the known-files list, the FIFO queue of paths the peer asked for,
//! and the single incoming file writer. Frames arrive over a typed channel
//! fed by the transport reader, so the engine can be driven with synthetic
//! frame sequences in tests.

use crate::protocol::{encode_frame, encode_manifest, parse_manifest, Frame, Opcode};
use crate::writer::IncomingWriter;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// What the caller should do after a frame is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// CLOSE (or an unrecognized opcode) was received; terminate the
    /// transport, process nothing further.
    Close,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the synced folder.
    pub root: PathBuf,
    /// Outbound chunk size in bytes; bounds PART payload size only.
    pub chunk_size: usize,
}

// =============================================================================
// Outbound queue
// =============================================================================

/// Streams queued files to the peer one frame at a time.
///
/// A bulk send must never monopolize the session loop: the peer answering
/// our INIT streams its own files back over the same socket, and a loop
/// that writes a whole file without draining inbound frames fills both TCP
/// windows until neither side can make progress. Each `step` call writes
/// exactly one frame (PATH, one PART, or END), so the caller can process
/// inbound frames between chunks while the wire still carries one file's
/// full PATH -> PART* -> END sequence at a time.
pub struct OutboundQueue {
    root: PathBuf,
    chunk_size: usize,
    queue: VecDeque<String>,
    current: Option<OutboundFile>,
}

struct OutboundFile {
    path: String,
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl OutboundQueue {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size,
            queue: VecDeque::new(),
            current: None,
        }
    }

    /// Queue paths behind any transfer already in progress.
    pub fn push(&mut self, paths: impl IntoIterator<Item = String>) {
        self.queue.extend(paths);
    }

    /// Whether every queued file has been fully streamed.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Write the next frame of the transfer in progress, or start the next
    /// queued file. A no-op when idle.
    pub async fn step<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let finished = match &mut self.current {
            None => {
                let Some(path) = self.queue.pop_front() else {
                    return Ok(());
                };
                tracing::info!(%path, "starting to send file");
                writer
                    .write_all(&encode_frame(Opcode::NewFilePath, path.as_bytes()))
                    .await?;
                let full_path = crate::writer::resolve_path(&self.root, &path)?;
                let file = File::open(&full_path).await.with_context(|| {
                    format!("failed to open {} for sending", full_path.display())
                })?;
                self.current = Some(OutboundFile {
                    path,
                    reader: BufReader::new(file),
                    buf: vec![0u8; self.chunk_size],
                });
                false
            }
            Some(current) => {
                let n = current.reader.read(&mut current.buf).await?;
                if n > 0 {
                    writer
                        .write_all(&encode_frame(Opcode::NewFilePart, &current.buf[..n]))
                        .await?;
                    false
                } else {
                    writer
                        .write_all(&encode_frame(Opcode::NewFileEnd, current.path.as_bytes()))
                        .await?;
                    writer.flush().await?;
                    tracing::info!(path = %current.path, "finished sending file");
                    true
                }
            }
        };
        if finished {
            self.current = None;
        }
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Per-connection sync state machine.
pub struct SyncEngine {
    known_files: Vec<String>,
    outbound: OutboundQueue,
    writer: IncomingWriter,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, known_files: Vec<String>) -> Self {
        Self {
            writer: IncomingWriter::new(config.root.clone()),
            outbound: OutboundQueue::new(config.root, config.chunk_size),
            known_files,
        }
    }

    /// Files known to this side, including everything received so far.
    pub fn known_files(&self) -> &[String] {
        &self.known_files
    }

    /// Perform the connect-time handshake: the raw API key bytes, unframed,
    /// immediately followed by one INIT frame carrying the local manifest.
    pub async fn handshake<W>(&self, api_key: &str, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(api_key.as_bytes())
            .await
            .context("failed to send API key")?;
        let manifest = encode_manifest(&self.known_files);
        writer
            .write_all(&encode_frame(Opcode::Init, &manifest))
            .await
            .context("failed to send INIT frame")?;
        writer.flush().await?;
        Ok(())
    }

    /// Process frames from the channel until the peer closes or the channel
    /// is exhausted, interleaving at most one outbound frame per iteration
    /// so bulk sends never stop inbound frames from being handled. Returns
    /// the final known-files list.
    pub async fn run<W>(
        mut self,
        mut frames: mpsc::Receiver<Frame>,
        writer: &mut W,
    ) -> Result<Vec<String>>
    where
        W: AsyncWrite + Unpin,
    {
        let mut open = true;
        loop {
            // Handle everything already decoded before the next write.
            while open {
                match frames.try_recv() {
                    Ok(frame) => {
                        if self.handle_frame(frame).await? == Control::Close {
                            return Ok(self.known_files);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => open = false,
                }
            }

            if !self.outbound.is_idle() {
                self.outbound.step(writer).await?;
            } else if open {
                match frames.recv().await {
                    Some(frame) => {
                        if self.handle_frame(frame).await? == Control::Close {
                            return Ok(self.known_files);
                        }
                    }
                    None => open = false,
                }
            } else {
                break;
            }
        }
        Ok(self.known_files)
    }

    /// Dispatch one decoded frame. Frames are handled one at a time in
    /// arrival order. INIT only queues the requested paths; the run loop
    /// streams them between inbound frames.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<Control> {
        match Opcode::from_u8(frame.opcode) {
            Some(Opcode::Init) => {
                let requested = parse_manifest(&frame.payload)?;
                if !requested.is_empty() {
                    tracing::info!(files = ?requested, "peer requested files");
                    self.outbound.push(requested);
                }
            }
            Some(Opcode::NewFilePath) => {
                let path = payload_path(&frame)?;
                tracing::info!(%path, "starting to receive file");
                self.writer.announce(path);
            }
            Some(Opcode::NewFilePart) => {
                self.writer.append(&frame.payload).await?;
            }
            Some(Opcode::NewFileEnd) => {
                let path = payload_path(&frame)?;
                if self.writer.finalize(&path).await? {
                    tracing::info!(%path, "fully received file");
                    self.known_files.push(path);
                }
            }
            Some(Opcode::Close) | None => {
                tracing::info!(opcode = frame.opcode, "connection close requested");
                return Ok(Control::Close);
            }
        }
        Ok(Control::Continue)
    }
}

fn payload_path(frame: &Frame) -> Result<String> {
    let path = std::str::from_utf8(&frame.payload)
        .map_err(|e| anyhow::anyhow!("invalid UTF-8 in file path: {}", e))?;
    Ok(path.to_string())
}

/// Read and decode frames from `reader`, forwarding them in order over a
/// bounded channel. The task ends on EOF, a read error, a decode error, or
/// the receiver side hanging up.
pub fn spawn_frame_reader<R>(mut reader: R) -> mpsc::Receiver<Frame>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    tokio::spawn(async move {
        let mut decoder = crate::protocol::FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("socket read failed: {}", e);
                    break;
                }
            };
            let frames = match decoder.decode(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::error!("frame decode failed: {:#}", e);
                    break;
                }
            };
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

/// Channel size for the transport reader -> engine frame queue.
pub const FRAME_CHANNEL_SIZE: usize = 64;

/// Socket read buffer size.
const READ_BUF_SIZE: usize = 64 * 1024;

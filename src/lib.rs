//! filesync - folder synchronization over a framed TCP protocol.
//!
//! One persistent connection per client; every unit on the wire is an
//! `opcode | len:u32 LE | payload` frame. On connect a client presents its
//! raw API key and an INIT manifest of its files; each side then requests
//! what it lacks and streams files one at a time.
//!
//! ```text
//! socket bytes -> FrameDecoder -> frame channel -> SyncEngine
//!                                                     |-> IncomingWriter (disk)
//!                                                     |-> outbound frames (socket)
//! ```

pub mod config;
pub mod engine;
pub mod protocol;
pub mod scanner;
pub mod server;
pub mod transport;
pub mod writer;

pub use config::{ClientConfig, ServerConfig};
pub use engine::{Control, EngineConfig, OutboundQueue, SyncEngine};
pub use protocol::{encode_frame, encode_manifest, parse_manifest, Frame, FrameDecoder, Opcode};
pub use writer::IncomingWriter;

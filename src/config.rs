//! Environment-driven configuration for the client and server binaries.
//!
//! All values come from environment variables. `--debug` supplies a fixed
//! default for every variable that is unset; outside debug mode a missing
//! variable is a startup failure.

use crate::protocol::MAX_FRAME_SIZE;
use anyhow::Result;
use std::path::PathBuf;

/// Debug default for the API key.
pub const DEBUG_API_KEY: &str = "SUPER-SECRET-API-KEY";
/// Debug default for the server port.
pub const DEBUG_PORT: u16 = 8080;
/// Debug default for the outbound chunk size (10MB).
pub const DEBUG_CHUNK_SIZE: usize = 1_000_000 * 10;
/// Debug default for the client folder.
pub const DEBUG_CLIENT_FOLDER: &str = "mounted-client-folder";
/// Debug default for the server folder.
pub const DEBUG_SERVER_FOLDER: &str = "mounted-server-folder";

/// Configuration for the sync client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    pub api_key: String,
    pub chunk_size: usize,
}

impl ClientConfig {
    /// Read `SERVER_HOST`, `SERVER_PORT`, `CLIENT_FOLDER`, `API_KEY` and
    /// `CHUNK_SIZE`. In debug mode each unset variable individually falls
    /// back to its documented default.
    pub fn from_env(debug: bool) -> Result<Self> {
        let host = get_env("SERVER_HOST", debug.then(|| "localhost".to_string()));
        let port = get_env("SERVER_PORT", debug.then_some(DEBUG_PORT));
        let root = get_env("CLIENT_FOLDER", debug.then(|| PathBuf::from(DEBUG_CLIENT_FOLDER)));
        let api_key = get_env("API_KEY", debug.then(|| DEBUG_API_KEY.to_string()));
        let chunk_size = get_env("CHUNK_SIZE", debug.then_some(DEBUG_CHUNK_SIZE));

        let (Some(host), Some(port), Some(root), Some(api_key), Some(chunk_size)) =
            (host, port, root, api_key, chunk_size)
        else {
            anyhow::bail!(
                "at least one required env var was missing or invalid: \
                 SERVER_HOST, SERVER_PORT, CLIENT_FOLDER, API_KEY (censored), CHUNK_SIZE"
            );
        };

        validate_common(&api_key, chunk_size)?;
        Ok(Self {
            host,
            port,
            root,
            api_key,
            chunk_size,
        })
    }
}

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub root: PathBuf,
    pub api_key: String,
    pub chunk_size: usize,
}

impl ServerConfig {
    /// Read `SERVER_PORT`, `SERVER_FOLDER`, `API_KEY` and `CHUNK_SIZE`,
    /// with the same debug-mode fallback rules as the client.
    pub fn from_env(debug: bool) -> Result<Self> {
        let port = get_env("SERVER_PORT", debug.then_some(DEBUG_PORT));
        let root = get_env("SERVER_FOLDER", debug.then(|| PathBuf::from(DEBUG_SERVER_FOLDER)));
        let api_key = get_env("API_KEY", debug.then(|| DEBUG_API_KEY.to_string()));
        let chunk_size = get_env("CHUNK_SIZE", debug.then_some(DEBUG_CHUNK_SIZE));

        let (Some(port), Some(root), Some(api_key), Some(chunk_size)) =
            (port, root, api_key, chunk_size)
        else {
            anyhow::bail!(
                "at least one required env var was missing or invalid: \
                 SERVER_PORT, SERVER_FOLDER, API_KEY (censored), CHUNK_SIZE"
            );
        };

        validate_common(&api_key, chunk_size)?;
        Ok(Self {
            port,
            root,
            api_key,
            chunk_size,
        })
    }
}

fn validate_common(api_key: &str, chunk_size: usize) -> Result<()> {
    if api_key.is_empty() {
        anyhow::bail!("API_KEY must not be empty");
    }
    if chunk_size == 0 || chunk_size > MAX_FRAME_SIZE as usize {
        anyhow::bail!(
            "CHUNK_SIZE must be between 1 and {} bytes, got {}",
            MAX_FRAME_SIZE,
            chunk_size
        );
    }
    Ok(())
}

fn get_env<T>(name: &str, fallback: Option<T>) -> Option<T>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(value) => value.parse().ok(),
        Err(_) => fallback,
    }
}

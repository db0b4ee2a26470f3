use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dns::pool::BufferPool;
use crate::dns::protocol::{HEADER_LEN, MAX_MESSAGE_SIZE};

#[derive(Debug, Display, From)]
pub enum ConfigError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub listen: SocketAddr,
    pub max_message_size: usize,
    pub pool_capacity: usize,
    pub rent_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// How long the server waits for the next request on an idle connection.
    pub idle_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 53)),
            max_message_size: MAX_MESSAGE_SIZE,
            pool_capacity: 128,
            rent_timeout_ms: None,
            connect_timeout_ms: 2000,
            io_timeout_ms: 5000,
            idle_timeout_ms: 30000,
        }
    }
}

impl TransportConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<TransportConfig, ConfigError> {
        let file = File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    /// Size of each transit buffer, clamped to what a length prefix can
    /// describe.
    pub fn message_size(&self) -> usize {
        self.max_message_size.clamp(HEADER_LEN, MAX_MESSAGE_SIZE)
    }

    pub fn rent_timeout(&self) -> Option<Duration> {
        self.rent_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// State shared by everything serving requests: configuration, the buffer
/// pool and the token that shuts it all down.
pub struct ServerContext {
    pub config: TransportConfig,
    pub pool: BufferPool,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(config: TransportConfig) -> ServerContext {
        ServerContext {
            pool: BufferPool::from_config(&config),
            config,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        ServerContext::new(TransportConfig::default())
    }
}

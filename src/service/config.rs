extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::{HeaderLayout, MAX_FRAME_LENGTH};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    /// Listen backlog handed to the OS.
    pub backlog: u32,
    /// Upper bound on concurrently open connections. Also the number of
    /// receive and send slots pre-allocated.
    pub max_connections: usize,
    /// Payload bytes per receive window; the header region comes on top.
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Number of accept lanes kept outstanding on the listener.
    pub max_simultaneous_accepts: usize,
    pub header_layout: HeaderLayout,
    pub no_delay: bool,
    /// Close the connection on an invalid header instead of restarting the
    /// header read.
    pub close_on_malformed_header: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "127.0.0.1".to_string(),
            port: 9800,
            backlog: 1024,
            max_connections: 1000,
            receive_buffer_size: 4096,
            send_buffer_size: 4096,
            max_simultaneous_accepts: 4,
            header_layout: HeaderLayout::Compact,
            no_delay: true,
            close_on_malformed_header: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> AppResult<()> {
        check_positive("server.backlog", self.backlog as usize)?;
        check_positive("server.max_connections", self.max_connections)?;
        check_positive("server.max_simultaneous_accepts", self.max_simultaneous_accepts)?;
        check_buffer("server.receive_buffer_size", self.receive_buffer_size)?;
        check_buffer("server.send_buffer_size", self.send_buffer_size)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address used by the command line `send` subcommand.
    pub server_address: String,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// No timeout when unset.
    pub connect_timeout_ms: Option<u64>,
    pub header_layout: HeaderLayout,
    pub no_delay: bool,
    pub close_on_malformed_header: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_address: "127.0.0.1:9800".to_string(),
            receive_buffer_size: 4096,
            send_buffer_size: 4096,
            connect_timeout_ms: Some(5000),
            header_layout: HeaderLayout::Compact,
            no_delay: true,
            close_on_malformed_header: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.connect_timeout_ms == Some(0) {
            return Err(AppError::InvalidValue(
                "client.connect_timeout_ms must be positive".to_string(),
            ));
        }
        check_buffer("client.receive_buffer_size", self.receive_buffer_size)?;
        check_buffer("client.send_buffer_size", self.send_buffer_size)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

fn check_positive(name: &str, value: usize) -> AppResult<()> {
    if value == 0 {
        return Err(AppError::InvalidValue(format!("{} must be positive", name)));
    }
    Ok(())
}

fn check_buffer(name: &str, value: usize) -> AppResult<()> {
    check_positive(name, value)?;
    if value > MAX_FRAME_LENGTH + HeaderLayout::Wide.header_size() {
        return Err(AppError::InvalidValue(format!(
            "{} of {} is larger than any frame",
            name, value
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramewireConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl FramewireConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<FramewireConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let framewire_config: FramewireConfig = config.try_deserialize()?;
        framewire_config.validate()?;
        Ok(framewire_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.server.validate()?;
        self.client.validate()
    }
}

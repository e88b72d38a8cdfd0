//! Application configuration
//!
//! Settings are read from a TOML file (by default `config.toml` in the
//! platform config directory) and can be overridden from the command line.
//! A missing default file simply yields the built-in defaults.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::gain::{MAX_GAIN, MIN_GAIN};
use crate::audio::sink::SinkTarget;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::{Quality, SessionConfig};

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    /// Platform default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file gives defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(Error::Config(format!("config file {} not found", path.display())));
            }
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write the configuration, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

/// Receiving side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Sink path (usually the virtual source's FIFO), or `-` for stdout
    pub sink: String,
    /// Volume applied before writing to the sink (0.0-2.0)
    pub device_volume: f32,
    pub handshake_timeout_ms: u64,
    /// Per-read socket timeout while streaming
    pub read_timeout_ms: u64,
    /// Longest wait for buffered audio to reach the sink at session end
    pub drain_timeout_ms: u64,
    pub recv_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            sink: DEFAULT_SINK_PATH.to_string(),
            device_volume: 1.0,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            drain_timeout_ms: DRAIN_TIMEOUT_MS,
            recv_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind address '{}'", self.bind_address)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn sink_target(&self) -> SinkTarget {
        SinkTarget::parse(&self.sink)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        validate_volume("device_volume", self.device_volume)?;
        if self.read_timeout_ms == 0 {
            return Err(Error::Config("read_timeout_ms must be positive".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::Config("handshake_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Sending side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Input device name; the default input device when unset
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per chunk
    pub frame_size: u32,
    pub quality: Quality,
    /// Gain applied before transmission (0.0-2.0)
    pub volume: f32,
    pub connect_timeout_ms: u64,
    pub send_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_size: DEFAULT_FRAME_SIZE,
            quality: Quality::Balanced,
            volume: 1.0,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            send_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Adjust sample rate and frame size to suit the quality preset.
    ///
    /// Low latency caps the frame size at 128 and the rate at 22050 Hz; high
    /// quality raises them to at least 512 and 44100 Hz. Balanced keeps the
    /// configured values.
    pub fn apply_quality_preset(&mut self) {
        match self.quality {
            Quality::LowLatency => {
                self.frame_size = self.frame_size.min(128);
                self.sample_rate = self.sample_rate.min(22050);
            }
            Quality::HighQuality => {
                self.frame_size = self.frame_size.max(512);
                self.sample_rate = self.sample_rate.max(44100);
            }
            Quality::Balanced => {}
        }
    }

    /// The parameters announced to the server
    pub fn session_config(&self) -> Result<SessionConfig> {
        SessionConfig::new(self.sample_rate, self.channels, self.frame_size, self.quality)
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_volume("volume", self.volume)?;
        self.session_config()?;
        Ok(())
    }
}

fn validate_volume(name: &str, value: f32) -> Result<()> {
    if !(MIN_GAIN..=MAX_GAIN).contains(&value) {
        return Err(Error::Config(format!(
            "{} must be between {} and {}, got {}",
            name, MIN_GAIN, MAX_GAIN, value
        )));
    }
    Ok(())
}

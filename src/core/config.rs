use crate::protocol::properties::{ConnectProperties, WillProperties};
use crate::protocol::{ProtocolVersion, Qos};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const FLUSH_INTERVAL_MICROS_DEFAULT: u64 = 100;
const KEEPALIVE_FACTOR_MIN: f64 = 0.5;
const KEEPALIVE_FACTOR_MAX: f64 = 2.0;

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_keepalive_factor() -> f64 {
    1.0
}

fn default_clean_start() -> bool {
    true
}

fn default_flush_interval_micros() -> u64 {
    FLUSH_INTERVAL_MICROS_DEFAULT
}

fn default_channel_capacity() -> usize {
    128
}

/// Connection options for one MQTT session.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// Client identifier sent in CONNECT. May be empty when the server
    /// assigns one (clean start required by the protocol in that case).
    pub client_id: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Keepalive interval in seconds; 0 disables keepalive entirely.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    /// Multiplier applied to the keepalive interval to form the PINGRESP
    /// deadline. Out-of-range values clamp to [0.5, 2.0].
    #[serde(default = "default_keepalive_factor")]
    pub keepalive_factor: f64,
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub will: Option<WillConfig>,
    /// MQTT 5.0 CONNECT properties, passed through verbatim.
    #[serde(default)]
    pub connect_properties: ConnectProperties,
    /// Write-coalescing window for the send pipeline.
    #[serde(default = "default_flush_interval_micros")]
    pub flush_interval_micros: u64,
    /// Capacity of every bounded channel on the connection.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Will message registered at CONNECT time.
#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub properties: WillProperties,
}

impl Options {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version: ProtocolVersion::default(),
            keep_alive_secs: default_keep_alive_secs(),
            keepalive_factor: default_keepalive_factor(),
            clean_start: default_clean_start(),
            username: None,
            password: None,
            will: None,
            connect_properties: ConnectProperties::default(),
            flush_interval_micros: default_flush_interval_micros(),
            channel_capacity: default_channel_capacity(),
        }
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_keepalive_factor(mut self, factor: f64) -> Self {
        self.keepalive_factor = factor;
        self
    }

    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_will(mut self, will: WillConfig) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_connect_properties(mut self, properties: ConnectProperties) -> Self {
        self.connect_properties = properties;
        self
    }

    /// Load options from a TOML or JSON file, dispatching on extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("reading options file {}", path_ref.display()))?;
        let options: Self = if path_ref.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&data)
                .with_context(|| format!("parsing {} as JSON", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("parsing {} as TOML", path_ref.display()))?
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() && !self.clean_start {
            bail!("an empty client_id requires clean_start");
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be non-zero");
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() {
                bail!("will topic must not be empty");
            }
        }
        if !self.keepalive_factor.is_finite() {
            bail!("keepalive_factor must be finite");
        }
        Ok(())
    }

    /// Keepalive factor with out-of-range values clamped to the nearest
    /// bound.
    pub fn effective_keepalive_factor(&self) -> f64 {
        self.keepalive_factor
            .clamp(KEEPALIVE_FACTOR_MIN, KEEPALIVE_FACTOR_MAX)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_micros(self.flush_interval_micros)
    }
}

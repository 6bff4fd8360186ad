//! Server configuration
//!
//! Loads server and room settings from an optional TOML file. Command line flags
//! are applied on top by `main`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::room::{PositionPolicy, RoomMetadata, RoomSettings, DEFAULT_SPAWN_RADIUS};

/// Default room type name clients join
pub const DEFAULT_ROOM_TYPE: &str = "my_room";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for the single room type served
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomConfig {
    /// Room type name used by `join_or_create`
    pub room_type: String,
    /// Free-form description attached to every instance
    pub description: Option<String>,
    /// Radius of the spawn circle around the origin
    pub spawn_radius: f64,
    /// Dispose a room after it has been empty this long; never when unset
    pub empty_room_timeout_secs: Option<u64>,
    /// Drop position updates beyond this absolute coordinate; accept all when unset
    pub max_abs_coordinate: Option<f64>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_type: DEFAULT_ROOM_TYPE.to_string(),
            description: Some("Shared player positions".to_string()),
            spawn_radius: DEFAULT_SPAWN_RADIUS,
            empty_room_timeout_secs: None,
            max_abs_coordinate: None,
        }
    }
}

impl RoomConfig {
    pub fn metadata(&self) -> RoomMetadata {
        RoomMetadata {
            room_type: self.room_type.clone(),
            description: self.description.clone(),
        }
    }

    pub fn settings(&self) -> RoomSettings {
        let position_policy = match self.max_abs_coordinate {
            Some(limit) => PositionPolicy::Bounded { limit },
            None => PositionPolicy::Trust,
        };
        RoomSettings {
            spawn_radius: self.spawn_radius,
            position_policy,
        }
    }

    pub fn empty_room_timeout(&self) -> Option<Duration> {
        self.empty_room_timeout_secs.map(Duration::from_secs)
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// WebSocket port
    pub port: u16,
    /// Port of the HTTP health endpoint; disabled when unset
    pub health_port: Option<u16>,
    /// Room settings
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 2567,
            health_port: None,
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default room settings
    #[cfg(test)]
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the health endpoint port
    pub fn with_health_port(mut self, health_port: Option<u16>) -> Self {
        self.health_port = health_port;
        self
    }

    /// Check values that deserialize fine but cannot be served
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.room_type.is_empty() {
            return Err(ConfigError::Invalid("room.room_type cannot be empty".to_string()));
        }
        if !self.room.spawn_radius.is_finite() || self.room.spawn_radius < 0.0 {
            return Err(ConfigError::Invalid(
                "room.spawn_radius must be a non-negative number".to_string(),
            ));
        }
        if let Some(limit) = self.room.max_abs_coordinate {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(ConfigError::Invalid(
                    "room.max_abs_coordinate must be a positive number".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Get the health endpoint address, if enabled
    pub fn health_addr(&self) -> Option<String> {
        self.health_port.map(|port| format!("{}:{}", self.bind, port))
    }
}

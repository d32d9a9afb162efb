//! Configuration for headmore.
//!
//! Settings are read from `~/.headmore/config.toml` (or the path given with
//! `--config`). Every key is optional; a missing file means all defaults.
//!
//! # Configuration File
//!
//! ```toml
//! [viewer]
//! fps = 10            # redraw rate when idle
//! show_pointer = false
//! shared = true       # let other viewers stay connected
//!
//! [geometry]
//! max_zoom = 15
//! zoom_step = 1.2
//! pan_step = 0.2
//!
//! [input]
//! combo_window_us = 2000     # Esc + key within this window is Alt+key
//! control_interval_ms = 100  # minimum spacing of viewer commands
//!
//! [connection]
//! poll_timeout_ms = 100
//! default_port = 5900
//!
//! [log]
//! level = "info"
//! # file = "/tmp/headmore.log"
//!
//! [theme]
//! status_fg = { r = 255, g = 255, b = 255 }
//! status_bg = { r = 0, g = 0, b = 170 }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Upper bound for `geometry.max_zoom`
pub const MAX_ZOOM_LEVELS: usize = 64;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub viewer: ViewerConfig,
    pub geometry: GeometryConfig,
    pub input: InputConfig,
    pub connection: ConnectionConfig,
    pub log: LogConfig,
    pub theme: ThemeConfig,
}

/// Viewer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Redraw rate when no input arrives. Raising it too high makes the
    /// controls sluggish on large terminals.
    pub fps: u32,
    /// Draw a marker at the pointer position from the start
    pub show_pointer: bool,
    /// Ask the server to keep other viewers connected
    pub shared: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            show_pointer: false,
            shared: true,
        }
    }
}

impl ViewerConfig {
    /// Time between idle redraws
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}

/// Zoom and pan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    pub max_zoom: usize,
    pub zoom_step: f32,
    pub pan_step: f32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            max_zoom: 15,
            zoom_step: 1.20,
            pan_step: 0.20,
        }
    }
}

/// Key disambiguation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub combo_window_us: u64,
    pub control_interval_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            combo_window_us: 2000,
            control_interval_ms: 100,
        }
    }
}

impl InputConfig {
    pub fn combo_window(&self) -> Duration {
        Duration::from_micros(self.combo_window_us)
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long the I/O thread waits for a message before checking for
    /// cancellation
    pub poll_timeout_ms: u64,
    pub default_port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            default_port: 5900,
        }
    }
}

impl ConnectionConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Colors of the status line, help panel and pointer marker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub status_fg: Color,
    pub status_bg: Color,
    pub pointer: Color,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            status_fg: Color::new(255, 255, 255),
            status_bg: Color::new(0, 0, 170),
            pointer: Color::new(255, 0, 255),
        }
    }
}

/// Color definition (RGB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject values the viewer cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.viewer.fps == 0 {
            return Err(ConfigError::Invalid("viewer.fps must be at least 1".into()));
        }
        if self.geometry.max_zoom == 0 || self.geometry.max_zoom > MAX_ZOOM_LEVELS {
            return Err(ConfigError::Invalid(format!(
                "geometry.max_zoom must be between 1 and {}",
                MAX_ZOOM_LEVELS
            )));
        }
        if !(self.geometry.zoom_step > 1.0) {
            return Err(ConfigError::Invalid("geometry.zoom_step must be greater than 1.0".into()));
        }
        if !(self.geometry.pan_step > 0.0) {
            return Err(ConfigError::Invalid("geometry.pan_step must be positive".into()));
        }
        // Keep it under a second so cancellation stays responsive
        if self.connection.poll_timeout_ms == 0 || self.connection.poll_timeout_ms >= 1000 {
            return Err(ConfigError::Invalid(
                "connection.poll_timeout_ms must be between 1 and 999".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the config and log files
    pub fn config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".headmore"))
    }

    fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Log file location: explicit setting, else next to the config file
    pub fn log_path(&self) -> PathBuf {
        if let Some(file) = &self.log.file {
            return file.clone();
        }
        Self::config_dir()
            .map(|dir| dir.join("headmore.log"))
            .unwrap_or_else(|| PathBuf::from("headmore.log"))
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

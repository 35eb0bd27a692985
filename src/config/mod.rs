//! Configuration management for tether
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. Every section is optional; command line flags override
//! what the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TetherConfig {
    /// Toplevel metadata and initial size
    #[serde(default)]
    pub window: WindowConfig,

    /// Fill colors and frame pacing
    #[serde(default)]
    pub render: RenderConfig,

    /// Export/import handle distribution
    #[serde(default)]
    pub foreign: ForeignConfig,

    /// Size channel between a leader and a follower
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Overrides for the per-mode window defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WindowConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    /// Size used until the compositor proposes one
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    /// Checkerboard colors, 0xAARRGGBB
    #[serde(default = "RenderConfig::default_first_color")]
    pub first_color: u32,
    #[serde(default = "RenderConfig::default_second_color")]
    pub second_color: u32,
    /// Flat fill for the importer and the size leader
    #[serde(default = "RenderConfig::default_fill_color")]
    pub fill_color: u32,
    /// Checkerboard square size in pixels
    #[serde(default = "RenderConfig::default_tile_size")]
    pub tile_size: u32,
    /// Redraw on every frame callback
    #[serde(default = "RenderConfig::default_frame_pacing")]
    pub frame_pacing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ForeignConfig {
    /// Exporter writes the handle here, importer reads it from here
    #[serde(default)]
    pub handle_file: Option<PathBuf>,
}

/// How sizes travel between processes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SyncTransport {
    /// Polled text file
    #[default]
    File,
    /// Local socket with one JSON message per resize
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub transport: SyncTransport,
    #[serde(default = "SyncConfig::default_path")]
    pub path: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            first_color: Self::default_first_color(),
            second_color: Self::default_second_color(),
            fill_color: Self::default_fill_color(),
            tile_size: Self::default_tile_size(),
            frame_pacing: Self::default_frame_pacing(),
        }
    }
}

impl RenderConfig {
    fn default_first_color() -> u32 {
        0xFF666666
    }
    fn default_second_color() -> u32 {
        0xFFEEEEEE
    }
    fn default_fill_color() -> u32 {
        0xFFFFFFFF
    }
    fn default_tile_size() -> u32 {
        8
    }
    fn default_frame_pacing() -> bool {
        true
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: SyncTransport::default(),
            path: Self::default_path(),
        }
    }
}

impl SyncConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("./share_data.txt")
    }
}

/// Expand a leading `~` to `$HOME`
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

impl TetherConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        PathBuf::from("~/.config/tether/tether.toml")
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: TetherConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.window.width == Some(0) || self.window.height == Some(0) {
            anyhow::bail!("Invalid window size: width and height must be positive");
        }

        if matches!(&self.window.title, Some(title) if title.trim().is_empty()) {
            anyhow::bail!("Invalid window title: must not be empty");
        }

        if self.render.tile_size == 0 {
            anyhow::bail!("Invalid tile_size: must be at least 1");
        }

        if self.sync.path.as_os_str().is_empty() {
            anyhow::bail!("Invalid sync path: must not be empty");
        }

        Ok(())
    }
}

//! Configuration management for swiftpane
//!
//! Settings are read from a TOML file. Every section is optional and falls
//! back to its defaults; command-line flags are applied on top afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::graphics::ClearColor;
use crate::negotiator::WindowGeometry;
use crate::orchestrator::{InitStrategy, StartupOptions};
use crate::protocol::WindowRequest;

/// Where `swiftpane` looks when no `--config` is given
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/swiftpane/swiftpane.toml";

/// Largest accepted window dimension on either axis
const MAX_DIMENSION: u32 = 16384;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SwiftpaneConfig {
    /// Toplevel title, app id and initial size
    #[serde(default)]
    pub window: WindowConfig,

    /// Bring-up ordering and handshake limits
    #[serde(default)]
    pub startup: StartupConfig,

    /// Fixed-rate loop after the first frame
    #[serde(default)]
    pub presentation: PresentationConfig,

    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,

    /// Application id handed to the shell (used for desktop file matching)
    pub app_id: String,

    /// Size used until the compositor proposes one (pixels)
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StartupConfig {
    /// "overlapped" or "sequential"
    pub strategy: InitStrategy,

    /// How long to wait for the first configure (milliseconds, 0 = forever)
    pub configure_timeout_ms: u64,

    /// Run against the built-in simulated compositor and software renderer
    pub headless: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresentationConfig {
    /// Frames presented after the first one
    pub frame_count: u64,

    /// Target frame interval (milliseconds, 0 = unpaced)
    pub interval_ms: u64,

    /// Consecutive transient present failures tolerated (0 = none)
    pub present_retry_limit: u32,

    pub clear_color: ClearColor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,

    /// Print the startup timeline as JSON on exit
    pub timeline_json: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let geometry = WindowGeometry::default();
        Self {
            title: "swiftpane".to_string(),
            app_id: "org.swiftpane.Swiftpane".to_string(),
            width: geometry.width,
            height: geometry.height,
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            strategy: InitStrategy::Overlapped,
            configure_timeout_ms: Self::default_configure_timeout_ms(),
            headless: false,
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            frame_count: 300,
            interval_ms: 16,
            present_retry_limit: Self::default_present_retry_limit(),
            clear_color: ClearColor::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug: false,
            timeline_json: false,
        }
    }
}

impl StartupConfig {
    fn default_configure_timeout_ms() -> u64 {
        5000
    }

    pub fn configure_timeout(&self) -> Option<Duration> {
        match self.configure_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl PresentationConfig {
    fn default_present_retry_limit() -> u32 {
        3
    }
}

impl SwiftpaneConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: SwiftpaneConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let window = &self.window;
        if window.width == 0 || window.height == 0 {
            anyhow::bail!("Invalid window size {}x{}: must be non-zero", window.width, window.height);
        }
        if window.width > MAX_DIMENSION || window.height > MAX_DIMENSION {
            anyhow::bail!(
                "Invalid window size {}x{}: must not exceed {}",
                window.width,
                window.height,
                MAX_DIMENSION
            );
        }

        if window.app_id.trim().is_empty() {
            anyhow::bail!("Invalid app_id: must not be empty");
        }

        if self.presentation.interval_ms > 1000 {
            anyhow::bail!("Invalid interval_ms: must be at most 1000");
        }

        if !self.presentation.clear_color.is_normalized() {
            anyhow::bail!("Invalid clear_color: channels must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Orchestrator settings derived from this configuration
    pub fn startup_options(&self) -> StartupOptions {
        StartupOptions {
            window: WindowRequest {
                title: self.window.title.clone(),
                app_id: self.window.app_id.clone(),
            },
            initial_geometry: WindowGeometry::new(self.window.width, self.window.height),
            strategy: self.startup.strategy,
            configure_timeout: self.startup.configure_timeout(),
            frame_count: self.presentation.frame_count,
            frame_interval: Duration::from_millis(self.presentation.interval_ms),
            clear_color: self.presentation.clear_color,
            present_retry_limit: self.presentation.present_retry_limit,
        }
    }
}

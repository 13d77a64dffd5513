//! Core types for Kino Control

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A selectable rendition as reported by the playback engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Engine-specific identifier
    pub id: String,
    /// Frame height in pixels
    pub height: u32,
    /// Advertised bandwidth in bits per second
    pub bandwidth: Option<u64>,
    pub codec: Option<String>,
    pub fps: Option<f32>,
}

impl Level {
    pub fn new(id: impl Into<String>, height: u32, bandwidth: Option<u64>) -> Self {
        Self {
            id: id.into(),
            height,
            bandwidth,
            codec: None,
            fps: None,
        }
    }

    /// Key used to order a ladder: bandwidth when known, height otherwise
    pub fn sort_key(&self) -> u64 {
        self.bandwidth
            .filter(|b| *b > 0)
            .unwrap_or(self.height as u64)
    }
}

/// Level selection command for the playback engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelSelection {
    /// Let the engine adapt freely (within the current ceiling)
    Auto,
    Id(String),
    Height(u32),
}

/// User-facing quality choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitySelection {
    Auto,
    /// Keep adapting, but never above this height
    Ceiling(u32),
}

/// Startup rendition policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialLevel {
    Auto,
    /// Start on the lowest rendition
    Low,
    Height(u32),
}

/// Connection class as reported by the Network Information API `effectiveType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NetworkClass {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    Cellular2g,
    #[serde(rename = "3g")]
    Cellular3g,
    #[serde(rename = "4g")]
    Cellular4g,
    #[serde(rename = "5g")]
    Cellular5g,
}

impl NetworkClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkClass::Slow2g => "slow-2g",
            NetworkClass::Cellular2g => "2g",
            NetworkClass::Cellular3g => "3g",
            NetworkClass::Cellular4g => "4g",
            NetworkClass::Cellular5g => "5g",
        }
    }
}

impl FromStr for NetworkClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => Ok(NetworkClass::Slow2g),
            "2g" => Ok(NetworkClass::Cellular2g),
            "3g" => Ok(NetworkClass::Cellular3g),
            "4g" => Ok(NetworkClass::Cellular4g),
            "5g" => Ok(NetworkClass::Cellular5g),
            other => Err(Error::InvalidConfig(format!(
                "unknown network class: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Player viewport measurements in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    /// Height of the player container
    pub container_height: f64,
    /// Height of the screen, used while fullscreen
    pub screen_height: Option<f64>,
    pub fullscreen: bool,
}

impl Viewport {
    pub fn new(container_height: f64) -> Self {
        Self {
            container_height,
            screen_height: None,
            fullscreen: false,
        }
    }

    /// Height that actually bounds the picture
    pub fn effective_height(&self) -> f64 {
        if self.fullscreen {
            self.screen_height.unwrap_or(self.container_height)
        } else {
            self.container_height
        }
    }
}

/// ABR tuner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Rendition to start on
    pub initial_level: InitialLevel,
    /// Buffer ahead (seconds) considered safe for ramping and decisions
    pub min_buffer_sec: f64,
    /// Cap renditions to the player size
    pub cap_to_viewport: bool,
    /// Cap renditions to the connection class
    pub net_aware_cap: bool,
    /// Overrides for the network cap table
    pub net_cap_map: BTreeMap<NetworkClass, u32>,
    /// Manual ceiling reverts to auto after this long (0 disables)
    pub auto_revert_ms: u64,
    /// EMA smoothing factor, weight of the newest sample
    pub ema_alpha: f64,
    /// Bandwidth sampling period
    pub bw_sample_ms: u64,
    /// Delay before the first ramp-to-auto attempt
    pub ramp_grace_ms: u64,
    /// Retry period while the buffer is still too short to ramp
    pub ramp_retry_ms: u64,
    /// Fraction of the smoothed bandwidth a downswitch target may use
    pub downswitch_safety: f64,
    /// Dropped-frame delta that forces a downswitch
    pub dropped_frames_threshold: u64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            initial_level: InitialLevel::Low,
            min_buffer_sec: 3.0,
            cap_to_viewport: true,
            net_aware_cap: true,
            net_cap_map: BTreeMap::new(),
            auto_revert_ms: 10 * 60 * 1000,
            ema_alpha: 0.25,
            bw_sample_ms: 1000,
            ramp_grace_ms: 4000,
            ramp_retry_ms: 1500,
            downswitch_safety: 0.8,
            dropped_frames_threshold: 10,
        }
    }
}

impl AbrConfig {
    /// Clamp out-of-range values into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.min_buffer_sec = if self.min_buffer_sec.is_finite() {
            self.min_buffer_sec.clamp(0.0, 30.0)
        } else {
            3.0
        };
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            self.ema_alpha = 0.25;
        }
        self.bw_sample_ms = self.bw_sample_ms.clamp(250, 5000);
        if !(self.downswitch_safety > 0.0 && self.downswitch_safety <= 1.0) {
            self.downswitch_safety = 0.8;
        }
        self
    }

    pub fn bw_sample_period(&self) -> Duration {
        Duration::from_millis(self.bw_sample_ms)
    }

    pub fn auto_revert(&self) -> Option<Duration> {
        (self.auto_revert_ms > 0).then(|| Duration::from_millis(self.auto_revert_ms))
    }
}

/// Ad subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdConfig {
    /// Midroll polling period
    pub midroll_poll_ms: u64,
    /// A midroll starts this many seconds before its offset
    pub midroll_lead_sec: f64,
    /// Fraction of duration used for offsets that carry no percentage
    pub pending_midroll_fraction: f64,
    /// Tolerance applied to the skip offset
    pub skip_epsilon_sec: f64,
    /// Maximum VAST wrapper hops (`None` follows chains of any depth)
    pub max_wrapper_depth: Option<usize>,
    /// Timeout for VAST/VMAP requests
    pub request_timeout_ms: u64,
    /// Consecutive failed breaks after which ads stop for the session
    pub max_consecutive_failures: u32,
}

impl Default for AdConfig {
    fn default() -> Self {
        Self {
            midroll_poll_ms: 300,
            midroll_lead_sec: 0.25,
            pending_midroll_fraction: 0.5,
            skip_epsilon_sec: 0.01,
            max_wrapper_depth: None,
            request_timeout_ms: 10_000,
            max_consecutive_failures: 3,
        }
    }
}

impl AdConfig {
    pub fn midroll_poll_period(&self) -> Duration {
        Duration::from_millis(self.midroll_poll_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Complete control-plane configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub abr: AbrConfig,
    pub ads: AdConfig,
}

impl ControlConfig {
    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ControlConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(ControlConfig {
            abr: config.abr.normalized(),
            ads: config.ads,
        })
    }

    /// Load a JSON configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<()> {
        let fraction = self.ads.pending_midroll_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::InvalidConfig(format!(
                "pending_midroll_fraction must be within 0..=1, got {}",
                fraction
            )));
        }
        if self.ads.max_wrapper_depth == Some(0) {
            return Err(Error::InvalidConfig(
                "max_wrapper_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

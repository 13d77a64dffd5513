//! Capability surfaces implemented by the host player
//!
//! The control plane never decodes media itself. Content playback is driven
//! through [`PlaybackEngine`], ad creatives through [`AdMediaElement`]. Event
//! subscriptions are inverted: the host forwards [`EngineEvent`]s and
//! [`AdMediaEvent`]s to the tuner and the ad runtime.

use crate::types::{Level, LevelSelection};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Content playback engine (HLS/DASH/progressive binding)
pub trait PlaybackEngine: Send + Sync {
    /// Current rendition ladder
    fn levels(&self) -> Vec<Level>;

    fn set_level(&self, selection: LevelSelection);

    /// Engine-side bandwidth estimate in bits per second
    fn bandwidth_estimate(&self) -> Option<f64> {
        None
    }

    /// Total dropped frames since attach
    fn dropped_frames(&self) -> Option<u64> {
        None
    }

    /// End of the buffered range containing the playhead, in seconds
    fn buffered_end(&self) -> f64;

    fn current_time(&self) -> f64;

    /// Content duration, once known
    fn duration(&self) -> Option<f64>;

    fn play(&self);

    fn pause(&self);

    fn set_volume(&self, _volume: f64) {}

    fn set_muted(&self, _muted: bool) {}

    /// Upper bound on auto-selected rendition height (`None` removes it)
    fn set_max_resolution(&self, _height: Option<u32>) {}

    fn configure_abr(&self, _cap_to_viewport: bool) {}

    /// Seconds buffered ahead of the playhead
    fn buffer_ahead(&self) -> f64 {
        let ahead = self.buffered_end() - self.current_time();
        if ahead.is_finite() {
            ahead.max(0.0)
        } else {
            0.0
        }
    }
}

/// Notifications from the content engine consumed by the ABR tuner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BufferingStart,
    BufferingEnd,
    LevelSwitched { level: Level },
}

/// Media element dedicated to ad creatives
#[async_trait]
pub trait AdMediaElement: Send + Sync {
    /// Point the element at a creative and reset the playhead
    fn load(&self, url: &str);

    /// Start playback; an `Err` means the attempt was rejected
    async fn play(&self, muted: bool) -> Result<()>;

    fn pause(&self);

    fn current_time(&self) -> f64;

    /// Stop playback and drop the loaded creative
    fn release(&self);
}

/// Notifications from the ad media element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdMediaEvent {
    /// Time update or metadata load
    Progress {
        current_time: f64,
        duration: Option<f64>,
    },
    Playing,
    Paused,
    VolumeChanged { muted: bool },
    Ended,
    Error,
}

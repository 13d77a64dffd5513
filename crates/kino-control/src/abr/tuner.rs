//! ABR tuner
//!
//! Sits on top of the engine's own adaptation and steers it:
//! - Startup profile: begin low, ramp to auto once the buffer is healthy
//! - Downswitch on stalls, dropped frames or a short buffer
//! - Dynamic ceilings from viewport, network class and manual choice
//! - Manual stickiness with timed auto-revert

use super::caps::{viewport_cap, CapResolver, NetworkCapTable};
use super::estimator::BandwidthEstimator;
use crate::analytics::{AnalyticsEvent, AnalyticsSink, CapReason, StartupMode, SwitchReason};
use crate::engine::{EngineEvent, PlaybackEngine};
use crate::scheduler::{Scheduler, TimerToken};
use crate::types::*;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Current manual quality state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualSelection {
    Auto,
    Ceiling {
        height: u32,
        revert_after: Option<Duration>,
    },
}

impl ManualSelection {
    pub fn ceiling(&self) -> Option<u32> {
        match self {
            ManualSelection::Auto => None,
            ManualSelection::Ceiling { height, .. } => Some(*height),
        }
    }
}

/// Outcome of a downswitch evaluation that fired
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownswitchDecision {
    pub target: Level,
    pub reason: SwitchReason,
    pub dropped_frames_delta: u64,
    pub buffer_len: f64,
}

/// De-duplicate a ladder by height (id when height is unknown) and sort it
pub fn sorted_levels(levels: Vec<Level>) -> Vec<Level> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Level> = levels
        .into_iter()
        .filter(|l| {
            let key = if l.height > 0 {
                l.height.to_string()
            } else {
                l.id.clone()
            };
            seen.insert(key)
        })
        .collect();
    unique.sort_by_key(Level::sort_key);
    unique
}

/// Pick the downswitch target from a sorted ladder
///
/// With a bandwidth estimate, the target sits one step below the first level
/// whose bandwidth meets `safety * estimate`; if no level meets it the top
/// level is already affordable. Without an estimate the lower-middle level
/// is used.
pub fn select_downswitch_target(
    levels: &[Level],
    bandwidth: Option<f64>,
    safety: f64,
) -> Option<&Level> {
    if levels.is_empty() {
        return None;
    }
    match bandwidth.filter(|b| b.is_finite() && *b > 0.0) {
        Some(bw) => {
            let threshold = bw * safety;
            let index = match levels
                .iter()
                .position(|l| l.bandwidth.unwrap_or(0) as f64 >= threshold)
            {
                Some(0) => 0,
                Some(i) => i - 1,
                None => levels.len() - 1,
            };
            levels.get(index)
        }
        None => levels.get((levels.len() / 2).saturating_sub(1)),
    }
}

/// Closed-loop quality controller bound to one playback engine
pub struct AbrTuner {
    engine: Arc<dyn PlaybackEngine>,
    scheduler: Arc<dyn Scheduler>,
    analytics: Arc<dyn AnalyticsSink>,
    config: AbrConfig,
    net_caps: NetworkCapTable,
    estimator: BandwidthEstimator,
    caps: CapResolver,
    viewport_cap_on: bool,
    network_cap_on: bool,
    viewport: Option<Viewport>,
    network: Option<NetworkClass>,
    manual: ManualSelection,
    stall_count: u32,
    last_dropped: u64,
    suspended: bool,
    sample_timer: Option<TimerToken>,
    ramp_timer: Option<TimerToken>,
    revert_timer: Option<TimerToken>,
    stopped: bool,
}

impl AbrTuner {
    /// Apply the startup profile and begin sampling bandwidth
    #[instrument(skip_all, fields(initial = ?config.initial_level))]
    pub fn start(
        engine: Arc<dyn PlaybackEngine>,
        scheduler: Arc<dyn Scheduler>,
        analytics: Arc<dyn AnalyticsSink>,
        config: AbrConfig,
    ) -> Self {
        let config = config.normalized();
        let mut tuner = Self {
            net_caps: NetworkCapTable::with_overrides(&config.net_cap_map),
            estimator: BandwidthEstimator::new(config.ema_alpha),
            caps: CapResolver::new(),
            viewport_cap_on: config.cap_to_viewport,
            network_cap_on: config.net_aware_cap,
            viewport: None,
            network: None,
            manual: ManualSelection::Auto,
            stall_count: 0,
            last_dropped: 0,
            suspended: false,
            sample_timer: None,
            ramp_timer: None,
            revert_timer: None,
            stopped: false,
            engine,
            scheduler,
            analytics,
            config,
        };

        tuner.apply_startup();
        tuner.sample_timer = Some(tuner.scheduler.after(tuner.config.bw_sample_period()));
        tuner.recompute_caps();
        tuner
    }

    fn apply_startup(&mut self) {
        let start_height = match self.config.initial_level {
            InitialLevel::Auto => None,
            InitialLevel::Low => sorted_levels(self.engine.levels())
                .first()
                .map(|l| l.height)
                .filter(|h| *h > 0),
            InitialLevel::Height(h) => Some(h),
        };

        match start_height {
            Some(height) => {
                self.engine.set_level(LevelSelection::Height(height));
                self.analytics.emit(AnalyticsEvent::AbrStartup {
                    mode: StartupMode::Low,
                    height: Some(height),
                });
                self.ramp_timer = Some(
                    self.scheduler
                        .after(Duration::from_millis(self.config.ramp_grace_ms)),
                );
                info!(height, "ABR startup on fixed level");
            }
            None => {
                self.engine.set_level(LevelSelection::Auto);
                self.analytics.emit(AnalyticsEvent::AbrStartup {
                    mode: StartupMode::Auto,
                    height: None,
                });
                info!("ABR startup on auto");
            }
        }
    }

    /// Deliver a fired timer; returns false for unknown or superseded tokens
    pub fn on_timer(&mut self, token: TimerToken) -> bool {
        if self.stopped {
            return false;
        }
        if self.sample_timer == Some(token) {
            self.sample_bandwidth();
            self.sample_timer = Some(self.scheduler.after(self.config.bw_sample_period()));
            true
        } else if self.ramp_timer == Some(token) {
            self.ramp_timer = None;
            self.try_ramp_to_auto();
            true
        } else if self.revert_timer == Some(token) {
            self.revert_timer = None;
            self.revert_manual();
            true
        } else {
            debug!(token = token.0, "Ignoring stale ABR timer");
            false
        }
    }

    /// React to a content engine notification
    pub fn on_engine_event(&mut self, event: &EngineEvent) -> Option<DownswitchDecision> {
        if self.stopped {
            return None;
        }
        match event {
            EngineEvent::BufferingStart => {
                // Stalls while an ad break owns the screen do not count
                if !self.suspended {
                    self.stall_count += 1;
                }
                None
            }
            EngineEvent::BufferingEnd => self.evaluate_downswitch(),
            EngineEvent::LevelSwitched { .. } => {
                self.sample_bandwidth();
                None
            }
        }
    }

    fn sample_bandwidth(&mut self) {
        if self.suspended {
            return;
        }
        self.estimator.sample(self.engine.bandwidth_estimate());
    }

    /// Check the downswitch triggers and switch down if any fired
    pub fn evaluate_downswitch(&mut self) -> Option<DownswitchDecision> {
        if self.suspended {
            return None;
        }

        let dropped = self.engine.dropped_frames().unwrap_or(0);
        let dropped_delta = dropped.saturating_sub(self.last_dropped);
        self.last_dropped = dropped;

        let buffer_len = self.engine.buffer_ahead();
        let frames_bad = dropped_delta > self.config.dropped_frames_threshold;
        let buffer_low = buffer_len < self.config.min_buffer_sec;

        if self.stall_count == 0 && !frames_bad && !buffer_low {
            return None;
        }

        let levels = sorted_levels(self.engine.levels());
        let engine_bw = self.engine.bandwidth_estimate();
        let bandwidth = self.estimator.estimate().or(engine_bw);
        let target = select_downswitch_target(&levels, bandwidth, self.config.downswitch_safety)?
            .clone();

        let reason = if frames_bad {
            SwitchReason::DroppedFrames
        } else if buffer_low {
            SwitchReason::LowBuffer
        } else {
            SwitchReason::Stall
        };

        self.analytics.emit(AnalyticsEvent::AbrSwitch {
            reason,
            to: target.height,
            dropped_frames_delta: dropped_delta,
            buffer_len,
            est_bw: engine_bw,
            est_bw_ema: self.estimator.estimate(),
        });
        self.engine.set_level(LevelSelection::Height(target.height));
        self.stall_count = 0;

        info!(
            to = target.height,
            reason = ?reason,
            dropped_frames_delta = dropped_delta,
            buffer_len,
            "ABR downswitch"
        );

        Some(DownswitchDecision {
            target,
            reason,
            dropped_frames_delta: dropped_delta,
            buffer_len,
        })
    }

    fn try_ramp_to_auto(&mut self) {
        let buffer_len = self.engine.buffer_ahead();
        if buffer_len >= self.config.min_buffer_sec {
            self.engine.set_level(LevelSelection::Auto);
            info!(buffer_len, "ABR ramped to auto");
        } else {
            debug!(buffer_len, "Buffer too short to ramp, retrying");
            self.ramp_timer = Some(
                self.scheduler
                    .after(Duration::from_millis(self.config.ramp_retry_ms)),
            );
        }
    }

    /// Apply a user quality choice
    ///
    /// A ceiling keeps adaptation running below it and schedules a revert to
    /// auto; any new selection supersedes a pending revert.
    pub fn manual_selection(&mut self, selection: QualitySelection, revert_after: Option<Duration>) {
        if let Some(token) = self.revert_timer.take() {
            self.scheduler.cancel(token);
        }

        match selection {
            QualitySelection::Auto => {
                self.manual = ManualSelection::Auto;
                self.engine.set_level(LevelSelection::Auto);
            }
            QualitySelection::Ceiling(height) => {
                let revert_after = revert_after
                    .or_else(|| self.config.auto_revert())
                    .filter(|d| !d.is_zero());
                self.manual = ManualSelection::Ceiling {
                    height,
                    revert_after,
                };
                self.engine.set_level(LevelSelection::Auto);
                if let Some(delay) = revert_after {
                    self.revert_timer = Some(self.scheduler.after(delay));
                }
            }
        }

        self.analytics
            .emit(AnalyticsEvent::AbrManualSelection { selection });
        info!(selection = ?selection, "Manual quality selection");
        self.recompute_caps();
    }

    fn revert_manual(&mut self) {
        let after = match self.manual {
            ManualSelection::Ceiling {
                revert_after: Some(after),
                ..
            } => after,
            _ => return,
        };
        self.manual = ManualSelection::Auto;
        self.engine.set_level(LevelSelection::Auto);
        self.analytics.emit(AnalyticsEvent::AbrManualRevert {
            after_ms: after.as_millis() as u64,
        });
        info!(after_ms = after.as_millis() as u64, "Manual ceiling reverted to auto");
        self.recompute_caps();
    }

    pub fn set_viewport_cap(&mut self, enabled: bool) {
        self.viewport_cap_on = enabled;
        self.engine.configure_abr(enabled);
        self.recompute_caps();
    }

    pub fn set_network_cap(&mut self, enabled: bool) {
        self.network_cap_on = enabled;
        self.recompute_caps();
    }

    /// Record a resize or fullscreen change
    pub fn update_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
        if self.viewport_cap_on {
            self.recompute_caps();
        }
    }

    /// Record a connection class change
    pub fn update_network(&mut self, class: Option<NetworkClass>) {
        self.network = class;
        if self.network_cap_on {
            self.recompute_caps();
        }
    }

    /// Pause decisions while an ad break owns the screen
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Recompute every cap source from last-known inputs and push the ceiling
    pub fn recompute_caps(&mut self) -> Option<u32> {
        let viewport = if self.viewport_cap_on {
            self.viewport.as_ref().and_then(viewport_cap)
        } else {
            None
        };
        let network = if self.network_cap_on {
            self.network.and_then(|c| self.net_caps.cap_for(c))
        } else {
            None
        };

        self.caps.set(CapReason::Viewport, viewport);
        self.caps.set(CapReason::Network, network);
        self.caps.set(CapReason::Manual, self.manual.ceiling());

        for (reason, cap) in self.caps.active() {
            self.analytics.emit(AnalyticsEvent::AbrCap { reason, cap });
        }

        let ceiling = self.caps.effective();
        self.engine.set_max_resolution(ceiling);
        debug!(ceiling = ?ceiling, "Resolution ceiling applied");
        ceiling
    }

    pub fn effective_ceiling(&self) -> Option<u32> {
        self.caps.effective()
    }

    pub fn manual(&self) -> ManualSelection {
        self.manual
    }

    pub fn bandwidth_estimate(&self) -> Option<f64> {
        self.estimator.estimate()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Cancel every timer; further timers and events are ignored
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for token in [
            self.sample_timer.take(),
            self.ramp_timer.take(),
            self.revert_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(token);
        }
        debug!("ABR tuner stopped");
    }
}

impl Drop for AbrTuner {
    fn drop(&mut self) {
        self.stop();
    }
}

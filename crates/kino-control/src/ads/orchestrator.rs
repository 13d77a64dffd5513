//! Ad break state machine
//!
//! The orchestrator holds the whole ad state by value and never performs I/O.
//! Every input goes through [`AdOrchestrator::dispatch`], which returns the
//! side effects to execute (beacons, media and content commands, fetches,
//! analytics) in order. Async results come back as inputs tagged with the
//! [`BreakToken`] or epoch they were issued for; anything no longer current
//! is dropped.
//!
//! ```text
//!   Idle ──▶ Loading ──▶ Playing ◀──▶ Paused
//!    ▲          │           │
//!    │          ▼           ▼
//!    └──── Completed ◀── Error
//! ```

use super::beacon::with_error_code;
use super::model::*;
use crate::analytics::AnalyticsEvent;
use crate::engine::AdMediaEvent;
use crate::types::AdConfig;
use crate::{Error, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Identifies one attempt at playing a break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BreakToken {
    /// Source epoch, bumped on every reset
    pub epoch: u64,
    pub seq: u64,
}

/// Icon currently on screen, with its index in the creative
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleIcon {
    pub index: usize,
    #[serde(flatten)]
    pub icon: Icon,
}

/// Externally visible ad phase
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AdState {
    #[default]
    Idle,
    Loading {
        ad_break: AdBreak,
    },
    Playing {
        ad_break: AdBreak,
        remaining_sec: f64,
        skip_offset_sec: Option<f64>,
        skip_countdown_sec: Option<f64>,
        can_skip: bool,
        icons: Vec<VisibleIcon>,
    },
    Paused {
        ad_break: AdBreak,
        remaining_sec: f64,
    },
    Error {
        ad_break: AdBreak,
        message: String,
    },
    Completed {
        ad_break: AdBreak,
    },
}

impl AdState {
    /// True while a break owns the screen
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AdState::Loading { .. } | AdState::Playing { .. } | AdState::Paused { .. }
        )
    }

    pub fn ad_break(&self) -> Option<&AdBreak> {
        match self {
            AdState::Idle => None,
            AdState::Loading { ad_break }
            | AdState::Playing { ad_break, .. }
            | AdState::Paused { ad_break, .. }
            | AdState::Error { ad_break, .. }
            | AdState::Completed { ad_break } => Some(ad_break),
        }
    }
}

/// Everything the orchestrator reacts to
#[derive(Debug)]
pub enum AdInput {
    /// New ad configuration for the current source
    Configure(AdsDescriptor),
    /// Install a ready-made schedule
    Schedule(AdSchedule),
    VmapLoaded {
        epoch: u64,
        result: Result<AdSchedule>,
    },
    /// Periodic poll with the content position
    Tick {
        content_time: f64,
        content_duration: Option<f64>,
    },
    PlayBreak {
        id: String,
    },
    VastLoaded {
        token: BreakToken,
        response: VastResponse,
    },
    VastFailed {
        token: BreakToken,
        error: Error,
        /// Error URLs of wrappers visited before the failure
        error_urls: Vec<String>,
    },
    PlayResult {
        token: BreakToken,
        muted: bool,
        result: Result<()>,
    },
    Media(AdMediaEvent),
    ContentEnded,
    Skip,
    ClickThrough,
    IconClick {
        index: usize,
    },
    /// Source changed: forget everything from the previous one
    Reset,
}

/// Side effects requested by the orchestrator, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum AdEffect {
    State(AdState),
    PauseContent,
    ResumeContent,
    /// Drop the hold on content without resuming it, e.g. on a source change
    ReleaseContent,
    FetchVmap { epoch: u64, url: String },
    FetchVast { token: BreakToken, url: String },
    LoadMedia { url: String },
    PlayMedia { token: BreakToken, muted: bool },
    /// Stop and unload the ad media element
    ReleaseMedia,
    FireBeacons(Vec<String>),
    OpenUrl(String),
    Emit(AnalyticsEvent),
}

/// Pick the creative rendition: MP4 preferred, then highest bitrate
pub fn select_media_file(files: &[MediaFile]) -> Option<&MediaFile> {
    let mp4: Vec<&MediaFile> = files
        .iter()
        .filter(|f| f.mime_type.as_deref().unwrap_or_default().contains("mp4"))
        .collect();
    let pool = if mp4.is_empty() {
        files.iter().collect()
    } else {
        mp4
    };
    pool.into_iter()
        .min_by_key(|f| Reverse(f.bitrate.unwrap_or(0)))
}

#[derive(Debug, Default)]
struct BreakRuntime {
    quartiles: [bool; 3],
    progress_fired: HashSet<String>,
    icons_viewed: HashSet<usize>,
    started: bool,
    creative_view: bool,
    paused: bool,
    last_muted: Option<bool>,
}

#[derive(Debug)]
struct ActiveBreak {
    ad_break: AdBreak,
    token: BreakToken,
    vast: Option<VastResponse>,
    media_loaded: bool,
    muted: bool,
    current_time: f64,
    media_duration: Option<f64>,
    runtime: BreakRuntime,
}

impl ActiveBreak {
    fn linear(&self) -> Option<&LinearCreative> {
        self.vast.as_ref().and_then(|v| v.linear.as_ref())
    }
}

/// Ad break orchestrator for one player session
pub struct AdOrchestrator {
    config: AdConfig,
    epoch: u64,
    next_seq: u64,
    schedule: Option<AdSchedule>,
    served: HashSet<String>,
    in_progress: HashSet<String>,
    active: Option<ActiveBreak>,
    state: AdState,
    consecutive_failures: u32,
    blocked: bool,
}

impl AdOrchestrator {
    pub fn new(config: AdConfig) -> Self {
        Self {
            config,
            epoch: 0,
            next_seq: 0,
            schedule: None,
            served: HashSet::new(),
            in_progress: HashSet::new(),
            active: None,
            state: AdState::Idle,
            consecutive_failures: 0,
            blocked: false,
        }
    }

    pub fn state(&self) -> &AdState {
        &self.state
    }

    pub fn schedule(&self) -> Option<&AdSchedule> {
        self.schedule.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_served(&self, id: &str) -> bool {
        self.served.contains(id)
    }

    /// Ads stopped after too many consecutive failures
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn active_token(&self) -> Option<BreakToken> {
        self.active.as_ref().map(|a| a.token)
    }

    /// Last observed ad playhead, if a break is active
    pub fn ad_time(&self) -> Option<f64> {
        self.active.as_ref().map(|a| a.current_time)
    }

    pub fn markers(&self) -> Vec<f64> {
        self.schedule
            .as_ref()
            .map(AdSchedule::markers)
            .unwrap_or_default()
    }

    /// Apply one input and return the effects it produced
    pub fn dispatch(&mut self, input: AdInput) -> Vec<AdEffect> {
        let mut fx = Vec::new();

        match input {
            AdInput::Configure(descriptor) => self.configure(descriptor, &mut fx),
            AdInput::Schedule(schedule) => self.install_schedule(schedule, &mut fx),
            AdInput::VmapLoaded { epoch, result } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "Dropping stale VMAP result");
                } else if self.schedule.is_some() {
                    debug!("Schedule already present, ignoring VMAP result");
                } else {
                    match result {
                        Ok(schedule) => self.install_schedule(schedule, &mut fx),
                        Err(e) => {
                            warn!(error = %e, "VMAP fetch failed, continuing without ads");
                            fx.push(AdEffect::Emit(AnalyticsEvent::AdError {
                                break_id: None,
                                message: "vmap_fetch_error".to_string(),
                            }));
                        }
                    }
                }
            }
            AdInput::Tick {
                content_time,
                content_duration,
            } => self.tick(content_time, content_duration, &mut fx),
            AdInput::PlayBreak { id } => {
                self.start_break(&id, &mut fx);
            }
            AdInput::VastLoaded { token, response } => {
                if self.is_current(token) {
                    self.on_vast(response, &mut fx);
                } else {
                    debug!(?token, "Dropping stale VAST response");
                }
            }
            AdInput::VastFailed {
                token,
                error,
                error_urls,
            } => {
                if self.is_current(token) {
                    warn!(error = %error, "VAST resolution failed");
                    let urls = with_error_code(&error_urls, error.vast_error_code());
                    fire(&mut fx, urls);
                    self.fail_break("vast_fetch_error", &mut fx);
                } else {
                    debug!(?token, "Dropping stale VAST failure");
                }
            }
            AdInput::PlayResult {
                token,
                muted,
                result,
            } => {
                if self.is_current(token) {
                    self.on_play_result(token, muted, result, &mut fx);
                } else {
                    debug!(?token, "Dropping stale play result");
                }
            }
            AdInput::Media(event) => self.on_media(event, &mut fx),
            AdInput::ContentEnded => {
                let postroll = self.next_unserved(AdBreakKind::Postroll);
                if let Some(id) = postroll {
                    self.start_break(&id, &mut fx);
                }
            }
            AdInput::Skip => self.skip(&mut fx),
            AdInput::ClickThrough => self.click_through(&mut fx),
            AdInput::IconClick { index } => self.icon_click(index, &mut fx),
            AdInput::Reset => self.reset(&mut fx),
        }

        fx
    }

    fn configure(&mut self, descriptor: AdsDescriptor, fx: &mut Vec<AdEffect>) {
        if let Some(schedule) = descriptor.schedule {
            self.install_schedule(AdSchedule::from_descriptor(&schedule), fx);
        } else if let Some(url) = descriptor.vmap_url.filter(|u| !u.is_empty()) {
            if self.schedule.is_none() {
                fx.push(AdEffect::FetchVmap {
                    epoch: self.epoch,
                    url,
                });
            }
        }
    }

    fn install_schedule(&mut self, schedule: AdSchedule, fx: &mut Vec<AdEffect>) {
        let schedule = schedule.with_served(&self.served);
        info!(breaks = schedule.len(), "Ad schedule installed");
        self.schedule = Some(schedule);
        self.try_preroll(fx);
    }

    fn tick(&mut self, content_time: f64, content_duration: Option<f64>, fx: &mut Vec<AdEffect>) {
        let fraction = self.config.pending_midroll_fraction;
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.resolve_offsets(content_duration, fraction);
        }

        self.try_preroll(fx);
        if !self.can_start() {
            return;
        }

        let lead = self.config.midroll_lead_sec;
        let due = self.schedule.as_ref().and_then(|s| {
            s.breaks()
                .iter()
                .filter(|b| b.kind == AdBreakKind::Midroll)
                .filter(|b| !self.served.contains(&b.id) && !self.in_progress.contains(&b.id))
                .find(|b| matches!(b.offset_sec(), Some(at) if at > 0.0 && content_time >= at - lead))
                .map(|b| b.id.clone())
        });
        if let Some(id) = due {
            self.start_break(&id, fx);
        }
    }

    fn can_start(&self) -> bool {
        matches!(self.state, AdState::Idle) && self.active.is_none()
    }

    fn next_unserved(&self, kind: AdBreakKind) -> Option<String> {
        self.schedule.as_ref().and_then(|s| {
            s.breaks()
                .iter()
                .find(|b| {
                    b.kind == kind
                        && !self.served.contains(&b.id)
                        && !self.in_progress.contains(&b.id)
                })
                .map(|b| b.id.clone())
        })
    }

    fn try_preroll(&mut self, fx: &mut Vec<AdEffect>) {
        if !self.can_start() {
            return;
        }
        if let Some(id) = self.next_unserved(AdBreakKind::Preroll) {
            self.start_break(&id, fx);
        }
    }

    /// Begin a break; a no-op while another break is active or once served
    fn start_break(&mut self, id: &str, fx: &mut Vec<AdEffect>) -> bool {
        if self.blocked {
            debug!(break_id = %id, "Ads blocked after repeated failures");
            return false;
        }
        if self.served.contains(id) || self.in_progress.contains(id) || self.active.is_some() {
            return false;
        }
        let Some(ad_break) = self.schedule.as_ref().and_then(|s| s.get(id)).cloned() else {
            debug!(break_id = %id, "Unknown ad break");
            return false;
        };

        self.next_seq += 1;
        let token = BreakToken {
            epoch: self.epoch,
            seq: self.next_seq,
        };
        self.in_progress.insert(ad_break.id.clone());

        info!(break_id = %ad_break.id, kind = %ad_break.kind, "Ad break starting");

        let url = ad_break.vast_tag_url.clone();
        let (break_id, kind) = (ad_break.id.clone(), ad_break.kind);
        self.active = Some(ActiveBreak {
            ad_break: ad_break.clone(),
            token,
            vast: None,
            media_loaded: false,
            muted: false,
            current_time: 0.0,
            media_duration: None,
            runtime: BreakRuntime::default(),
        });

        self.set_state(AdState::Loading { ad_break }, fx);
        fx.push(AdEffect::PauseContent);
        fx.push(AdEffect::Emit(AnalyticsEvent::AdBreakStart { break_id, kind }));
        fx.push(AdEffect::FetchVast { token, url });
        true
    }

    fn is_current(&self, token: BreakToken) -> bool {
        self.active.as_ref().is_some_and(|a| a.token == token)
    }

    fn on_vast(&mut self, response: VastResponse, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let break_id = active.ad_break.id.clone();

        fire(fx, response.impressions.clone());
        fx.push(AdEffect::Emit(AnalyticsEvent::AdImpression {
            break_id: break_id.clone(),
        }));

        let media_url = response
            .linear
            .as_ref()
            .and_then(|l| select_media_file(&l.media_files))
            .map(|m| m.url.clone());
        let error_urls = response.error_urls.clone();
        active.vast = Some(response);

        match media_url {
            Some(url) => {
                debug!(break_id = %break_id, media = %url, "Loading ad media");
                active.media_loaded = true;
                fx.push(AdEffect::LoadMedia { url });
                fx.push(AdEffect::PlayMedia {
                    token: active.token,
                    muted: false,
                });
            }
            None => {
                let code = Error::NoLinearCreative.vast_error_code();
                fire(fx, with_error_code(&error_urls, code));
                self.fail_break("no_linear_media", fx);
            }
        }
    }

    fn on_play_result(
        &mut self,
        token: BreakToken,
        muted: bool,
        result: Result<()>,
        fx: &mut Vec<AdEffect>,
    ) {
        match result {
            Ok(()) => {
                if let Some(active) = self.active.as_mut() {
                    active.muted = muted;
                }
                self.update_playing(fx);
            }
            Err(e) if !muted => {
                debug!(error = %e, "Ad playback rejected, retrying muted");
                fx.push(AdEffect::PlayMedia { token, muted: true });
            }
            Err(e) => {
                warn!(error = %e, "Muted ad playback rejected");
                self.fail_break("ad_autoplay_blocked", fx);
            }
        }
    }

    fn on_media(&mut self, event: AdMediaEvent, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.as_mut().filter(|a| a.media_loaded) else {
            return;
        };

        match event {
            AdMediaEvent::Progress {
                current_time,
                duration,
            } => {
                active.current_time = if current_time.is_finite() {
                    current_time.max(0.0)
                } else {
                    0.0
                };
                if let Some(d) = duration.filter(|d| d.is_finite() && *d > 0.0) {
                    active.media_duration = Some(d);
                }
                self.update_playing(fx);
            }
            AdMediaEvent::Playing => {
                if active.runtime.paused {
                    active.runtime.paused = false;
                    if let Some(linear) = active.linear() {
                        fire(fx, linear.tracking_urls(TrackingEvent::Resume).to_vec());
                    }
                }
                self.update_playing(fx);
            }
            AdMediaEvent::Paused => {
                if !active.runtime.paused {
                    active.runtime.paused = true;
                    if let Some(linear) = active.linear() {
                        fire(fx, linear.tracking_urls(TrackingEvent::Pause).to_vec());
                    }
                }
                self.update_playing(fx);
            }
            AdMediaEvent::VolumeChanged { muted } => {
                active.muted = muted;
                match active.runtime.last_muted {
                    None => active.runtime.last_muted = Some(muted),
                    Some(previous) if previous != muted => {
                        active.runtime.last_muted = Some(muted);
                        let event = if muted {
                            TrackingEvent::Mute
                        } else {
                            TrackingEvent::Unmute
                        };
                        if let Some(linear) = active.linear() {
                            fire(fx, linear.tracking_urls(event).to_vec());
                        }
                    }
                    Some(_) => {}
                }
            }
            AdMediaEvent::Ended => {
                let break_id = active.ad_break.id.clone();
                if let Some(linear) = active.linear() {
                    fire(fx, linear.tracking_urls(TrackingEvent::Complete).to_vec());
                }
                fx.push(AdEffect::Emit(AnalyticsEvent::AdComplete { break_id }));
                self.end_break(EndReason::Complete, fx);
            }
            AdMediaEvent::Error => {
                let error_urls = active
                    .vast
                    .as_ref()
                    .map(|v| v.error_urls.clone())
                    .unwrap_or_default();
                let code = Error::MediaPlayback(String::new()).vast_error_code();
                fire(fx, with_error_code(&error_urls, code));
                self.fail_break("ad_media_error", fx);
            }
        }
    }

    /// Derive the playing view and fire once-per-break beacons
    fn update_playing(&mut self, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let ActiveBreak {
            ad_break,
            vast,
            runtime,
            current_time,
            media_duration,
            muted,
            ..
        } = active;
        let Some(linear) = vast.as_ref().and_then(|v| v.linear.as_ref()) else {
            return;
        };

        let break_id = ad_break.id.clone();
        let cur = *current_time;
        let known_duration = if linear.duration_sec > 0.0 {
            linear.duration_sec
        } else {
            media_duration.unwrap_or(0.0)
        };
        let remaining_sec = (known_duration - cur).ceil().max(0.0);

        let (skip_countdown_sec, can_skip) = match linear.skip_offset_sec {
            Some(offset) => {
                let left = (offset - cur).ceil().max(0.0);
                (Some(left), left <= 0.0)
            }
            None => (None, false),
        };

        if !runtime.started && cur > 0.0 {
            runtime.started = true;
            fire(fx, linear.tracking_urls(TrackingEvent::Start).to_vec());
            fx.push(AdEffect::Emit(AnalyticsEvent::AdStart {
                break_id: break_id.clone(),
                muted: *muted,
            }));
        }
        if !runtime.creative_view && cur > 0.0 {
            runtime.creative_view = true;
            fire(fx, linear.tracking_urls(TrackingEvent::CreativeView).to_vec());
        }

        for progress in &linear.progress {
            if cur >= progress.offset_sec && runtime.progress_fired.insert(progress.url.clone()) {
                fire(fx, vec![progress.url.clone()]);
                fx.push(AdEffect::Emit(AnalyticsEvent::AdProgress {
                    break_id: break_id.clone(),
                    at: progress.offset_sec,
                }));
            }
        }

        let ratio = cur / known_duration.max(0.1);
        for (i, threshold) in [0.25, 0.5, 0.75].into_iter().enumerate() {
            if runtime.quartiles[i] || ratio < threshold {
                continue;
            }
            runtime.quartiles[i] = true;
            let quartile = i as u8 + 1;
            if let Some(event) = TrackingEvent::quartile(quartile) {
                fire(fx, linear.tracking_urls(event).to_vec());
            }
            fx.push(AdEffect::Emit(AnalyticsEvent::AdQuartile {
                break_id: break_id.clone(),
                quartile,
            }));
        }

        let icons: Vec<VisibleIcon> = linear
            .icons
            .iter()
            .enumerate()
            .filter(|(_, icon)| icon.is_visible_at(cur))
            .map(|(index, icon)| VisibleIcon {
                index,
                icon: icon.clone(),
            })
            .collect();
        for visible in &icons {
            let urls = &visible.icon.view_tracking_urls;
            if !urls.is_empty() && runtime.icons_viewed.insert(visible.index) {
                fire(fx, urls.clone());
                fx.push(AdEffect::Emit(AnalyticsEvent::AdIconView {
                    break_id: break_id.clone(),
                    index: visible.index,
                    program: visible.icon.program.clone(),
                }));
            }
        }

        let next = if runtime.paused {
            AdState::Paused {
                ad_break: ad_break.clone(),
                remaining_sec,
            }
        } else {
            AdState::Playing {
                ad_break: ad_break.clone(),
                remaining_sec,
                skip_offset_sec: linear.skip_offset_sec,
                skip_countdown_sec,
                can_skip,
                icons,
            }
        };
        self.set_state(next, fx);
    }

    fn skip(&mut self, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let Some(linear) = active.linear() else {
            return;
        };
        let epsilon = self.config.skip_epsilon_sec;
        let allowed = linear
            .skip_offset_sec
            .is_some_and(|offset| active.current_time >= offset - epsilon);
        if !allowed {
            debug!(at = active.current_time, "Skip requested before skip offset");
            return;
        }

        let mut urls = linear.tracking_urls(TrackingEvent::Skip).to_vec();
        urls.extend_from_slice(linear.tracking_urls(TrackingEvent::CloseLinear));
        let break_id = active.ad_break.id.clone();

        fire(fx, urls);
        fx.push(AdEffect::Emit(AnalyticsEvent::AdSkip { break_id }));
        self.end_break(EndReason::Skip, fx);
    }

    fn click_through(&mut self, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let Some(linear) = active.linear() else {
            return;
        };
        let Some(url) = linear.click_through_url.clone() else {
            return;
        };

        fx.push(AdEffect::OpenUrl(url.clone()));
        fire(fx, linear.click_tracking_urls.clone());
        fx.push(AdEffect::Emit(AnalyticsEvent::AdClick {
            break_id: active.ad_break.id.clone(),
            url,
        }));
    }

    fn icon_click(&mut self, index: usize, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let Some(icon) = active.linear().and_then(|l| l.icons.get(index)) else {
            return;
        };

        if let Some(url) = icon.click_through_url.clone() {
            fx.push(AdEffect::OpenUrl(url));
        }
        fire(fx, icon.click_tracking_urls.clone());
        fx.push(AdEffect::Emit(AnalyticsEvent::AdIconClick {
            break_id: active.ad_break.id.clone(),
            index,
            program: icon.program.clone(),
        }));
    }

    fn fail_break(&mut self, message: &str, fx: &mut Vec<AdEffect>) {
        let Some(ad_break) = self.active.as_ref().map(|a| a.ad_break.clone()) else {
            return;
        };
        let break_id = ad_break.id.clone();
        self.set_state(
            AdState::Error {
                ad_break,
                message: message.to_string(),
            },
            fx,
        );
        fx.push(AdEffect::Emit(AnalyticsEvent::AdError {
            break_id: Some(break_id),
            message: message.to_string(),
        }));
        self.end_break(EndReason::Error, fx);
    }

    /// Tear down the active break; safe to call more than once
    fn end_break(&mut self, reason: EndReason, fx: &mut Vec<AdEffect>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let mut ad_break = active.ad_break;
        let break_id = ad_break.id.clone();

        fx.push(AdEffect::ReleaseMedia);

        ad_break.served = true;
        self.served.insert(break_id.clone());
        self.in_progress.remove(&break_id);
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.mark_served(&break_id);
        }

        self.set_state(AdState::Completed { ad_break }, fx);
        fx.push(AdEffect::Emit(AnalyticsEvent::AdBreakEnd {
            break_id: break_id.clone(),
            reason,
        }));
        fx.push(AdEffect::ResumeContent);

        if reason == EndReason::Error {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.config.max_consecutive_failures && !self.blocked {
                self.blocked = true;
                warn!(
                    failures = self.consecutive_failures,
                    "Too many failed ad breaks, ads disabled for this source"
                );
                fx.push(AdEffect::Emit(AnalyticsEvent::AdError {
                    break_id: None,
                    message: "ads_blocked".to_string(),
                }));
            }
        } else {
            self.consecutive_failures = 0;
        }

        info!(break_id = %break_id, reason = ?reason, "Ad break ended");
        self.set_state(AdState::Idle, fx);
    }

    fn reset(&mut self, fx: &mut Vec<AdEffect>) {
        if self.active.take().is_some() {
            fx.push(AdEffect::ReleaseMedia);
            fx.push(AdEffect::ReleaseContent);
        }
        self.epoch += 1;
        self.schedule = None;
        self.served.clear();
        self.in_progress.clear();
        self.consecutive_failures = 0;
        self.blocked = false;
        info!(epoch = self.epoch, "Ad session reset");
        self.set_state(AdState::Idle, fx);
    }

    fn set_state(&mut self, state: AdState, fx: &mut Vec<AdEffect>) {
        if self.state != state {
            self.state = state.clone();
            fx.push(AdEffect::State(state));
        }
    }
}

fn fire(fx: &mut Vec<AdEffect>, urls: Vec<String>) {
    if !urls.is_empty() {
        fx.push(AdEffect::FireBeacons(urls));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(url: &str, mime: &str, bitrate: Option<u32>) -> MediaFile {
        MediaFile {
            url: url.to_string(),
            mime_type: Some(mime.to_string()),
            width: None,
            height: None,
            bitrate,
        }
    }

    fn vast(duration: f64, skip: Option<f64>) -> VastResponse {
        let mut tracking = TrackingMap::new();
        for event in [
            "start", "firstQuartile", "midpoint", "thirdQuartile", "complete", "skip", "mute",
            "unmute", "pause", "resume",
        ] {
            tracking.insert(event.to_string(), vec![format!("https://t.example.com/{}", event)]);
        }
        VastResponse {
            impressions: vec!["https://t.example.com/imp".to_string()],
            error_urls: vec!["https://t.example.com/err?c=[ERRORCODE]".to_string()],
            linear: Some(LinearCreative {
                duration_sec: duration,
                skip_offset_sec: skip,
                media_files: vec![media("https://cdn.example.com/ad.mp4", "video/mp4", Some(1000))],
                tracking,
                ..Default::default()
            }),
        }
    }

    fn beacons(fx: &[AdEffect]) -> Vec<String> {
        fx.iter()
            .filter_map(|e| match e {
                AdEffect::FireBeacons(urls) => Some(urls.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn fetch_token(fx: &[AdEffect]) -> BreakToken {
        fx.iter()
            .find_map(|e| match e {
                AdEffect::FetchVast { token, .. } => Some(*token),
                _ => None,
            })
            .expect("no VAST fetch issued")
    }

    /// Orchestrator with a preroll already playing
    fn playing(duration: f64, skip: Option<f64>) -> (AdOrchestrator, BreakToken) {
        playing_with(vast(duration, skip))
    }

    fn playing_with(response: VastResponse) -> (AdOrchestrator, BreakToken) {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll(
            "preroll",
            "https://ads.example.com/pre",
        )])));
        let token = fetch_token(&fx);
        orch.dispatch(AdInput::VastLoaded { token, response });
        orch.dispatch(AdInput::PlayResult {
            token,
            muted: false,
            result: Ok(()),
        });
        (orch, token)
    }

    fn progress(orch: &mut AdOrchestrator, t: f64) -> Vec<AdEffect> {
        orch.dispatch(AdInput::Media(AdMediaEvent::Progress {
            current_time: t,
            duration: None,
        }))
    }

    #[test]
    fn test_select_media_file() {
        let files = vec![
            media("a.webm", "video/webm", Some(5000)),
            media("b.mp4", "video/mp4", Some(800)),
            media("c.mp4", "video/mp4", Some(1200)),
            media("d.mp4", "video/mp4", Some(1200)),
        ];
        assert_eq!(select_media_file(&files).unwrap().url, "c.mp4");

        let webm = vec![media("a.webm", "video/webm", None), media("b.webm", "video/webm", Some(10))];
        assert_eq!(select_media_file(&webm).unwrap().url, "b.webm");
        assert!(select_media_file(&[]).is_none());
    }

    #[test]
    fn test_preroll_starts_once() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll(
            "preroll",
            "https://ads.example.com/pre",
        )])));
        assert!(fx.contains(&AdEffect::PauseContent));
        assert!(matches!(orch.state(), AdState::Loading { .. }));

        for _ in 0..5 {
            let fx = orch.dispatch(AdInput::Tick {
                content_time: 0.0,
                content_duration: Some(60.0),
            });
            assert!(fx.is_empty());
            let fx = orch.dispatch(AdInput::PlayBreak {
                id: "preroll".to_string(),
            });
            assert!(fx.is_empty());
        }
    }

    #[test]
    fn test_quartiles_fire_once_in_order() {
        let (mut orch, _) = playing(20.0, None);
        let mut fired = Vec::new();
        for step in 1..=40 {
            fired.extend(beacons(&progress(&mut orch, step as f64 * 0.5)));
        }
        let quartiles: Vec<_> = fired
            .iter()
            .filter(|u| u.ends_with("Quartile") || u.ends_with("midpoint"))
            .cloned()
            .collect();
        assert_eq!(
            quartiles,
            vec![
                "https://t.example.com/firstQuartile",
                "https://t.example.com/midpoint",
                "https://t.example.com/thirdQuartile",
            ]
        );
        assert_eq!(fired.iter().filter(|u| u.ends_with("/start")).count(), 1);
    }

    #[test]
    fn test_progress_tracking_fires_once() {
        let mut response = vast(20.0, None);
        if let Some(linear) = response.linear.as_mut() {
            linear.progress = vec![
                ProgressTracking {
                    url: "https://t.example.com/p5".to_string(),
                    offset_sec: 5.0,
                },
                ProgressTracking {
                    url: "https://t.example.com/p10".to_string(),
                    offset_sec: 10.0,
                },
            ];
        }
        let (mut orch, _) = playing_with(response);

        assert!(!beacons(&progress(&mut orch, 4.9)).contains(&"https://t.example.com/p5".to_string()));

        let mut fired = Vec::new();
        let mut emitted = Vec::new();
        for t in [5.0, 5.0, 5.5, 9.0, 10.0, 10.5, 15.0] {
            let fx = progress(&mut orch, t);
            fired.extend(beacons(&fx));
            emitted.extend(fx.into_iter().filter_map(|e| match e {
                AdEffect::Emit(AnalyticsEvent::AdProgress { at, .. }) => Some(at),
                _ => None,
            }));
        }
        let progress_urls: Vec<_> = fired.iter().filter(|u| u.contains("/p")).cloned().collect();
        assert_eq!(
            progress_urls,
            vec!["https://t.example.com/p5", "https://t.example.com/p10"]
        );
        assert_eq!(emitted, vec![5.0, 10.0]);
    }

    #[test]
    fn test_icon_view_fires_on_visibility_edge() {
        let mut response = vast(20.0, None);
        if let Some(linear) = response.linear.as_mut() {
            linear.icons = vec![Icon {
                program: Some("AdChoices".to_string()),
                src: "https://cdn.example.com/icon.png".to_string(),
                width: 20,
                height: 20,
                x_position: HorizontalPosition::Right,
                y_position: VerticalPosition::Top,
                margin: None,
                offset_sec: Some(2.0),
                duration_sec: Some(3.0),
                click_through_url: None,
                click_tracking_urls: Vec::new(),
                view_tracking_urls: vec!["https://t.example.com/iconview".to_string()],
            }];
        }
        let (mut orch, _) = playing_with(response);
        let visible = |orch: &AdOrchestrator| match orch.state() {
            AdState::Playing { icons, .. } => icons.len(),
            _ => usize::MAX,
        };

        let mut views = 0;
        let fx = progress(&mut orch, 1.0);
        views += beacons(&fx).iter().filter(|u| u.ends_with("/iconview")).count();
        assert_eq!(visible(&orch), 0);

        let fx = progress(&mut orch, 2.0);
        views += beacons(&fx).iter().filter(|u| u.ends_with("/iconview")).count();
        assert!(fx.contains(&AdEffect::Emit(AnalyticsEvent::AdIconView {
            break_id: "preroll".to_string(),
            index: 0,
            program: Some("AdChoices".to_string()),
        })));
        assert_eq!(visible(&orch), 1);

        for t in [3.0, 4.5, 5.0] {
            let fx = progress(&mut orch, t);
            views += beacons(&fx).iter().filter(|u| u.ends_with("/iconview")).count();
        }
        assert_eq!(visible(&orch), 1);

        progress(&mut orch, 6.0);
        assert_eq!(visible(&orch), 0);
        assert_eq!(views, 1);
    }

    #[test]
    fn test_pause_resume_beacons() {
        let (mut orch, _) = playing(20.0, None);

        // Playing without a prior pause is not a resume
        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::Playing));
        assert!(beacons(&fx).is_empty());

        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::Paused));
        assert_eq!(beacons(&fx), vec!["https://t.example.com/pause"]);
        assert!(matches!(orch.state(), AdState::Paused { .. }));

        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::Paused));
        assert!(beacons(&fx).is_empty());

        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::Playing));
        assert_eq!(beacons(&fx), vec!["https://t.example.com/resume"]);
        assert!(matches!(orch.state(), AdState::Playing { .. }));

        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::Playing));
        assert!(beacons(&fx).is_empty());
    }

    #[test]
    fn test_skip_guard() {
        let (mut orch, _) = playing(30.0, Some(5.0));
        progress(&mut orch, 3.0);
        assert!(orch.dispatch(AdInput::Skip).is_empty());

        progress(&mut orch, 4.995);
        let fx = orch.dispatch(AdInput::Skip);
        assert!(beacons(&fx).contains(&"https://t.example.com/skip".to_string()));
        assert!(fx.contains(&AdEffect::ReleaseMedia));
        assert!(fx.contains(&AdEffect::ResumeContent));
        assert_eq!(orch.state(), &AdState::Idle);
        assert!(orch.is_served("preroll"));
    }

    #[test]
    fn test_not_skippable_without_offset() {
        let (mut orch, _) = playing(30.0, None);
        progress(&mut orch, 29.0);
        assert!(orch.dispatch(AdInput::Skip).is_empty());
    }

    #[test]
    fn test_autoplay_fallback() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll(
            "preroll",
            "https://ads.example.com/pre",
        )])));
        let token = fetch_token(&fx);
        orch.dispatch(AdInput::VastLoaded {
            token,
            response: vast(10.0, None),
        });

        let fx = orch.dispatch(AdInput::PlayResult {
            token,
            muted: false,
            result: Err(Error::AutoplayBlocked),
        });
        assert_eq!(fx, vec![AdEffect::PlayMedia { token, muted: true }]);

        let fx = orch.dispatch(AdInput::PlayResult {
            token,
            muted: true,
            result: Err(Error::AutoplayBlocked),
        });
        assert!(beacons(&fx).is_empty());
        assert!(fx.contains(&AdEffect::Emit(AnalyticsEvent::AdError {
            break_id: Some("preroll".to_string()),
            message: "ad_autoplay_blocked".to_string(),
        })));
        assert_eq!(orch.state(), &AdState::Idle);
    }

    #[test]
    fn test_muted_start_reported() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll("p", "u")])));
        let token = fetch_token(&fx);
        orch.dispatch(AdInput::VastLoaded {
            token,
            response: vast(10.0, None),
        });
        orch.dispatch(AdInput::PlayResult {
            token,
            muted: true,
            result: Ok(()),
        });
        let fx = progress(&mut orch, 0.3);
        assert!(fx.contains(&AdEffect::Emit(AnalyticsEvent::AdStart {
            break_id: "p".to_string(),
            muted: true,
        })));
    }

    #[test]
    fn test_no_linear_fires_401() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll("p", "u")])));
        let token = fetch_token(&fx);
        let fx = orch.dispatch(AdInput::VastLoaded {
            token,
            response: VastResponse {
                error_urls: vec!["https://t.example.com/e?c=[ERRORCODE]".to_string()],
                ..Default::default()
            },
        });
        assert_eq!(beacons(&fx), vec!["https://t.example.com/e?c=401"]);

        let states: Vec<_> = fx
            .iter()
            .filter_map(|e| match e {
                AdEffect::State(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert!(matches!(states[0], AdState::Error { .. }));
        assert!(matches!(states[1], AdState::Completed { .. }));
        assert_eq!(states[2], AdState::Idle);
        assert!(orch.is_served("p"));
    }

    #[test]
    fn test_stale_vast_after_reset() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll("p", "u")])));
        let token = fetch_token(&fx);

        let fx = orch.dispatch(AdInput::Reset);
        assert!(fx.contains(&AdEffect::ReleaseMedia));
        assert_eq!(orch.epoch(), 1);

        let fx = orch.dispatch(AdInput::VastLoaded {
            token,
            response: vast(10.0, None),
        });
        assert!(fx.is_empty());
        assert_eq!(orch.state(), &AdState::Idle);
    }

    #[test]
    fn test_served_survives_rebuild() {
        let (mut orch, _) = playing(10.0, None);
        orch.dispatch(AdInput::Media(AdMediaEvent::Ended));
        assert!(orch.is_served("preroll"));

        let fx = orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::preroll(
            "preroll",
            "https://ads.example.com/pre",
        )])));
        assert!(fx.is_empty());
        assert!(orch.schedule().unwrap().get("preroll").unwrap().served);
    }

    #[test]
    fn test_midroll_lead_and_unresolved_offset() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::midroll(
            "mid",
            TimeOffset::Unresolved,
            "u",
        )])));

        let fx = orch.dispatch(AdInput::Tick {
            content_time: 40.0,
            content_duration: None,
        });
        assert!(fx.is_empty());

        // floor(101 * 0.5) = 50, fires from 49.75
        let fx = orch.dispatch(AdInput::Tick {
            content_time: 49.7,
            content_duration: Some(101.0),
        });
        assert!(fx.is_empty());
        assert_eq!(orch.markers(), vec![50.0]);

        let fx = orch.dispatch(AdInput::Tick {
            content_time: 49.75,
            content_duration: Some(101.0),
        });
        assert!(fx.contains(&AdEffect::PauseContent));
    }

    #[test]
    fn test_percent_midroll_resolves_on_tick() {
        let mut orch = AdOrchestrator::new(AdConfig::default());
        orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![AdBreak::midroll(
            "quarter",
            TimeOffset::Percent(25.0),
            "u",
        )])));
        assert!(orch.markers().is_empty());

        let fx = orch.dispatch(AdInput::Tick {
            content_time: 10.0,
            content_duration: None,
        });
        assert!(fx.is_empty());

        // floor(121 * 0.25) = 30, fires from 29.75
        let fx = orch.dispatch(AdInput::Tick {
            content_time: 29.7,
            content_duration: Some(121.0),
        });
        assert!(fx.is_empty());
        assert_eq!(orch.markers(), vec![30.0]);

        // A later duration change does not move the break
        orch.dispatch(AdInput::Tick {
            content_time: 29.7,
            content_duration: Some(400.0),
        });
        assert_eq!(orch.markers(), vec![30.0]);

        let fx = orch.dispatch(AdInput::Tick {
            content_time: 29.75,
            content_duration: Some(400.0),
        });
        assert!(fx.contains(&AdEffect::PauseContent));
    }

    #[test]
    fn test_reset_mid_break_releases_without_resume() {
        let (mut orch, token) = playing(20.0, None);
        progress(&mut orch, 3.0);

        let fx = orch.dispatch(AdInput::Reset);
        assert!(fx.contains(&AdEffect::ReleaseMedia));
        assert!(fx.contains(&AdEffect::ReleaseContent));
        assert!(!fx.contains(&AdEffect::ResumeContent));
        assert_eq!(orch.state(), &AdState::Idle);
        assert!(orch.active_token().is_none());
        assert!(orch.schedule().is_none());
        assert!(!orch.is_served("preroll"));

        // Late media events for the torn-down break are dropped
        assert!(progress(&mut orch, 10.0).is_empty());
        assert!(orch
            .dispatch(AdInput::PlayResult {
                token,
                muted: false,
                result: Ok(()),
            })
            .is_empty());

        // Idle reset has nothing to release
        let fx = orch.dispatch(AdInput::Reset);
        assert!(!fx.contains(&AdEffect::ReleaseContent));
    }

    #[test]
    fn test_mute_beacon_suppressed_on_first_observation() {
        let (mut orch, _) = playing(10.0, None);
        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::VolumeChanged { muted: true }));
        assert!(beacons(&fx).is_empty());
        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::VolumeChanged { muted: false }));
        assert_eq!(beacons(&fx), vec!["https://t.example.com/unmute"]);
        let fx = orch.dispatch(AdInput::Media(AdMediaEvent::VolumeChanged { muted: false }));
        assert!(beacons(&fx).is_empty());
    }

    #[test]
    fn test_repeated_failures_block_ads() {
        let config = AdConfig {
            max_consecutive_failures: 2,
            ..Default::default()
        };
        let mut orch = AdOrchestrator::new(config);
        orch.dispatch(AdInput::Schedule(AdSchedule::new(vec![
            AdBreak::midroll("m1", TimeOffset::Seconds(10.0), "u1"),
            AdBreak::midroll("m2", TimeOffset::Seconds(20.0), "u2"),
            AdBreak::midroll("m3", TimeOffset::Seconds(30.0), "u3"),
        ])));

        for t in [10.0, 20.0] {
            let fx = orch.dispatch(AdInput::Tick {
                content_time: t,
                content_duration: Some(100.0),
            });
            let token = fetch_token(&fx);
            orch.dispatch(AdInput::VastFailed {
                token,
                error: Error::http_status("u", 500),
                error_urls: vec![],
            });
        }
        assert!(orch.is_blocked());

        let fx = orch.dispatch(AdInput::Tick {
            content_time: 30.0,
            content_duration: Some(100.0),
        });
        assert!(fx.is_empty());
    }
}

//! Tokio driver for the ad orchestrator
//!
//! Owns an [`AdOrchestrator`] and turns its effects into calls on the host
//! capabilities. Fetches and play attempts run as tasks whose results are
//! fed back as inputs; the orchestrator drops any that are no longer current.

use super::beacon::{BeaconFirer, HttpBeaconFirer};
use super::model::{AdSchedule, AdsDescriptor, VastResponse};
use super::orchestrator::{AdEffect, AdInput, AdOrchestrator, AdState, BreakToken};
use super::vast::{Fetcher, VastFailure, VastResolver};
use super::vmap::VmapResolver;
use crate::abr::AbrHandle;
use crate::analytics::{AnalyticsSink, NoopAnalytics};
use crate::engine::{AdMediaElement, AdMediaEvent, PlaybackEngine};
use crate::types::AdConfig;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Commands accepted by a running ad runtime
#[derive(Debug)]
pub enum AdCommand {
    Configure(AdsDescriptor),
    Schedule(AdSchedule),
    PlayBreak(String),
    Media(AdMediaEvent),
    ContentEnded,
    Skip,
    ClickThrough,
    IconClick(usize),
    Reset,
    Shutdown,
}

/// Cloneable handle to a running [`AdRuntime`]
#[derive(Debug, Clone)]
pub struct AdHandle {
    tx: mpsc::UnboundedSender<AdCommand>,
    state: watch::Receiver<AdState>,
}

impl AdHandle {
    /// Load the ad configuration for a new source
    pub fn configure(&self, descriptor: AdsDescriptor) {
        self.send(AdCommand::Configure(descriptor));
    }

    pub fn set_schedule(&self, schedule: AdSchedule) {
        self.send(AdCommand::Schedule(schedule));
    }

    pub fn play_break(&self, id: impl Into<String>) {
        self.send(AdCommand::PlayBreak(id.into()));
    }

    /// Forward an ad media element notification
    pub fn media_event(&self, event: AdMediaEvent) {
        self.send(AdCommand::Media(event));
    }

    pub fn content_ended(&self) {
        self.send(AdCommand::ContentEnded);
    }

    pub fn skip(&self) {
        self.send(AdCommand::Skip);
    }

    pub fn click_through(&self) {
        self.send(AdCommand::ClickThrough);
    }

    pub fn icon_click(&self, index: usize) {
        self.send(AdCommand::IconClick(index));
    }

    /// Forget schedule and served breaks, e.g. on source change
    pub fn reset(&self) {
        self.send(AdCommand::Reset);
    }

    pub fn shutdown(&self) {
        self.send(AdCommand::Shutdown);
    }

    /// Latest published ad state
    pub fn state(&self) -> AdState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<AdState> {
        self.state.clone()
    }

    fn send(&self, command: AdCommand) {
        if self.tx.send(command).is_err() {
            debug!("Ad runtime already stopped");
        }
    }
}

enum Completion {
    Vmap {
        epoch: u64,
        result: Result<AdSchedule>,
    },
    Vast {
        token: BreakToken,
        result: std::result::Result<VastResponse, VastFailure>,
    },
    Play {
        token: BreakToken,
        muted: bool,
        result: Result<()>,
    },
}

impl Completion {
    fn into_input(self) -> AdInput {
        match self {
            Completion::Vmap { epoch, result } => AdInput::VmapLoaded { epoch, result },
            Completion::Vast {
                token,
                result: Ok(response),
            } => AdInput::VastLoaded { token, response },
            Completion::Vast {
                token,
                result: Err(failure),
            } => AdInput::VastFailed {
                token,
                error: failure.error,
                error_urls: failure.error_urls,
            },
            Completion::Play {
                token,
                muted,
                result,
            } => AdInput::PlayResult {
                token,
                muted,
                result,
            },
        }
    }
}

/// Runs an [`AdOrchestrator`] against host capabilities on tokio
pub struct AdRuntime {
    engine: Arc<dyn PlaybackEngine>,
    media: Arc<dyn AdMediaElement>,
    fetcher: Arc<dyn Fetcher>,
    beacons: Arc<dyn BeaconFirer>,
    analytics: Arc<dyn AnalyticsSink>,
    abr: Option<AbrHandle>,
    url_opener: Option<mpsc::UnboundedSender<String>>,
    config: AdConfig,
}

impl AdRuntime {
    pub fn new(
        engine: Arc<dyn PlaybackEngine>,
        media: Arc<dyn AdMediaElement>,
        fetcher: Arc<dyn Fetcher>,
        config: AdConfig,
    ) -> Self {
        Self {
            engine,
            media,
            fetcher,
            beacons: Arc::new(HttpBeaconFirer::new()),
            analytics: Arc::new(NoopAnalytics),
            abr: None,
            url_opener: None,
            config,
        }
    }

    pub fn with_beacons(mut self, beacons: Arc<dyn BeaconFirer>) -> Self {
        self.beacons = beacons;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    /// Suspend ABR downswitching while a break owns the screen
    pub fn with_abr(mut self, abr: AbrHandle) -> Self {
        self.abr = Some(abr);
        self
    }

    /// Receive click-through URLs the host should open
    pub fn with_url_opener(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.url_opener = Some(tx);
        self
    }

    /// Start the runtime; it runs until [`AdHandle::shutdown`] or every handle is dropped
    pub fn spawn(self) -> (AdHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AdState::Idle);
        let poll_period = self.config.midroll_poll_period();

        let mut driver = Driver {
            orchestrator: AdOrchestrator::new(self.config.clone()),
            vast: Arc::new(
                VastResolver::new(self.fetcher.clone())
                    .with_max_wrapper_depth(self.config.max_wrapper_depth)
                    .with_request_timeout(Some(self.config.request_timeout())),
            ),
            vmap: Arc::new(VmapResolver::new(self.fetcher)),
            engine: self.engine,
            media: self.media,
            beacons: self.beacons,
            analytics: self.analytics,
            abr: self.abr,
            url_opener: self.url_opener,
            config: self.config,
            state_tx,
            tasks: JoinSet::new(),
        };

        let task = tokio::spawn(async move {
            let mut poll = tokio::time::interval(poll_period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Ad runtime started");

            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        None | Some(AdCommand::Shutdown) => break,
                        Some(command) => driver.command(command),
                    },
                    Some(joined) = driver.tasks.join_next() => match joined {
                        Ok(completion) => driver.handle(completion.into_input()),
                        Err(e) if e.is_cancelled() => debug!("Ad task cancelled"),
                        Err(e) => warn!(error = %e, "Ad task failed"),
                    },
                    _ = poll.tick() => {
                        let input = AdInput::Tick {
                            content_time: driver.engine.current_time(),
                            content_duration: driver.engine.duration(),
                        };
                        driver.handle(input);
                    }
                }
            }

            driver.teardown();
            info!("Ad runtime stopped");
        });

        (
            AdHandle {
                tx,
                state: state_rx,
            },
            task,
        )
    }
}

struct Driver {
    orchestrator: AdOrchestrator,
    vast: Arc<VastResolver>,
    vmap: Arc<VmapResolver>,
    engine: Arc<dyn PlaybackEngine>,
    media: Arc<dyn AdMediaElement>,
    beacons: Arc<dyn BeaconFirer>,
    analytics: Arc<dyn AnalyticsSink>,
    abr: Option<AbrHandle>,
    url_opener: Option<mpsc::UnboundedSender<String>>,
    config: AdConfig,
    state_tx: watch::Sender<AdState>,
    tasks: JoinSet<Completion>,
}

impl Driver {
    fn command(&mut self, command: AdCommand) {
        let input = match command {
            AdCommand::Configure(descriptor) => AdInput::Configure(descriptor),
            AdCommand::Schedule(schedule) => AdInput::Schedule(schedule),
            AdCommand::PlayBreak(id) => AdInput::PlayBreak { id },
            AdCommand::Media(event) => AdInput::Media(event),
            AdCommand::ContentEnded => AdInput::ContentEnded,
            AdCommand::Skip => {
                // Skip eligibility uses the element's playhead, not the last time update
                if self.orchestrator.active_token().is_some() {
                    self.handle(AdInput::Media(AdMediaEvent::Progress {
                        current_time: self.media.current_time(),
                        duration: None,
                    }));
                }
                AdInput::Skip
            }
            AdCommand::ClickThrough => AdInput::ClickThrough,
            AdCommand::IconClick(index) => AdInput::IconClick { index },
            AdCommand::Reset => {
                self.tasks.abort_all();
                AdInput::Reset
            }
            AdCommand::Shutdown => return,
        };
        self.handle(input);
    }

    fn handle(&mut self, input: AdInput) {
        for effect in self.orchestrator.dispatch(input) {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: AdEffect) {
        match effect {
            AdEffect::State(state) => {
                self.state_tx.send_replace(state);
            }
            AdEffect::PauseContent => {
                self.engine.pause();
                if let Some(abr) = &self.abr {
                    abr.set_suspended(true);
                }
            }
            AdEffect::ResumeContent => {
                self.engine.play();
                if let Some(abr) = &self.abr {
                    abr.set_suspended(false);
                }
            }
            AdEffect::ReleaseContent => {
                if let Some(abr) = &self.abr {
                    abr.set_suspended(false);
                }
            }
            AdEffect::FetchVmap { epoch, url } => {
                let vmap = self.vmap.clone();
                let timeout = self.config.request_timeout();
                self.tasks.spawn(async move {
                    let result = match tokio::time::timeout(timeout, vmap.resolve(&url)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::transport(&url, "request timed out")),
                    };
                    Completion::Vmap { epoch, result }
                });
            }
            AdEffect::FetchVast { token, url } => {
                let vast = self.vast.clone();
                self.tasks.spawn(async move {
                    let result = vast.resolve_traced(&url).await;
                    Completion::Vast { token, result }
                });
            }
            AdEffect::LoadMedia { url } => self.media.load(&url),
            AdEffect::PlayMedia { token, muted } => {
                let media = self.media.clone();
                self.tasks.spawn(async move {
                    let result = media.play(muted).await;
                    Completion::Play {
                        token,
                        muted,
                        result,
                    }
                });
            }
            AdEffect::ReleaseMedia => {
                self.media.pause();
                self.media.release();
            }
            AdEffect::FireBeacons(urls) => self.beacons.fire_all(&urls),
            AdEffect::OpenUrl(url) => match &self.url_opener {
                Some(tx) => {
                    if tx.send(url).is_err() {
                        debug!("Click-through receiver dropped");
                    }
                }
                None => debug!(url = %url, "No click-through handler"),
            },
            AdEffect::Emit(event) => self.analytics.emit(event),
        }
    }

    fn teardown(&mut self) {
        self.tasks.abort_all();
        let was_active = self.orchestrator.active_token().is_some();
        self.handle(AdInput::Reset);
        if was_active {
            self.execute(AdEffect::ResumeContent);
        }
    }
}

//! Tokio driver for the ABR tuner

use super::tuner::AbrTuner;
use crate::analytics::AnalyticsSink;
use crate::engine::{EngineEvent, PlaybackEngine};
use crate::scheduler::TokioScheduler;
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Commands accepted by a running tuner
#[derive(Debug, Clone)]
pub enum AbrCommand {
    ManualSelection {
        selection: QualitySelection,
        revert_after: Option<Duration>,
    },
    SetViewportCap(bool),
    SetNetworkCap(bool),
    Viewport(Viewport),
    Network(Option<NetworkClass>),
    Engine(EngineEvent),
    Suspend(bool),
    Stop,
}

/// Cloneable handle to a running [`AbrService`]
#[derive(Debug, Clone)]
pub struct AbrHandle {
    tx: mpsc::UnboundedSender<AbrCommand>,
}

impl AbrHandle {
    pub fn manual_selection(&self, selection: QualitySelection, revert_after: Option<Duration>) {
        self.send(AbrCommand::ManualSelection {
            selection,
            revert_after,
        });
    }

    pub fn set_viewport_cap(&self, enabled: bool) {
        self.send(AbrCommand::SetViewportCap(enabled));
    }

    pub fn set_network_cap(&self, enabled: bool) {
        self.send(AbrCommand::SetNetworkCap(enabled));
    }

    pub fn update_viewport(&self, viewport: Viewport) {
        self.send(AbrCommand::Viewport(viewport));
    }

    pub fn update_network(&self, class: Option<NetworkClass>) {
        self.send(AbrCommand::Network(class));
    }

    /// Forward a content engine notification
    pub fn engine_event(&self, event: EngineEvent) {
        self.send(AbrCommand::Engine(event));
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.send(AbrCommand::Suspend(suspended));
    }

    pub fn stop(&self) {
        self.send(AbrCommand::Stop);
    }

    fn send(&self, command: AbrCommand) {
        if self.tx.send(command).is_err() {
            debug!("ABR service already stopped");
        }
    }
}

/// Runs an [`AbrTuner`] on tokio timers
pub struct AbrService;

impl AbrService {
    /// Start the tuner; it runs until [`AbrHandle::stop`] or every handle is dropped
    pub fn spawn(
        engine: Arc<dyn PlaybackEngine>,
        analytics: Arc<dyn AnalyticsSink>,
        config: AbrConfig,
    ) -> (AbrHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let (scheduler, mut fired) = TokioScheduler::new();
            let scheduler = Arc::new(scheduler);
            let mut tuner = AbrTuner::start(engine, scheduler.clone(), analytics, config);
            info!("ABR service started");

            loop {
                tokio::select! {
                    Some(token) = fired.recv() => {
                        tuner.on_timer(token);
                    }
                    command = rx.recv() => match command {
                        None | Some(AbrCommand::Stop) => break,
                        Some(command) => apply(&mut tuner, command),
                    },
                }
            }

            tuner.stop();
            info!("ABR service stopped");
        });

        (AbrHandle { tx }, task)
    }
}

fn apply(tuner: &mut AbrTuner, command: AbrCommand) {
    match command {
        AbrCommand::ManualSelection {
            selection,
            revert_after,
        } => tuner.manual_selection(selection, revert_after),
        AbrCommand::SetViewportCap(enabled) => tuner.set_viewport_cap(enabled),
        AbrCommand::SetNetworkCap(enabled) => tuner.set_network_cap(enabled),
        AbrCommand::Viewport(viewport) => tuner.update_viewport(viewport),
        AbrCommand::Network(class) => tuner.update_network(class),
        AbrCommand::Engine(event) => {
            tuner.on_engine_event(&event);
        }
        AbrCommand::Suspend(suspended) => tuner.set_suspended(suspended),
        AbrCommand::Stop => tuner.stop(),
    }
}

//! Kino Control - Playback control plane for Kino
//!
//! This crate sits between a player UI and its playback engine:
//! - VAST/VMAP ad schedules with wrapper-chain resolution
//! - Ad break orchestration with IAB tracking beacons
//! - ABR tuning: startup level, downswitch, viewport/network caps
//! - Analytics event emission
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Kino Control                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  VMAP / VAST │  │     Ad       │  │   Beacon     │           │
//! │  │   Resolver   │──│ Orchestrator │──│   Firer      │           │
//! │  └──────────────┘  └──────┬───────┘  └──────────────┘           │
//! │                           │                                     │
//! │                    ┌──────┴──────┐       ┌──────────────┐       │
//! │                    │ Ad Runtime  │──────▶│ ABR Service  │       │
//! │                    └──────┬──────┘       └──────┬───────┘       │
//! │                           │                     │               │
//! │  ┌──────────────┐  ┌──────┴─────────────────────┴──┐            │
//! │  │  Analytics   │  │  PlaybackEngine / AdMedia     │            │
//! │  │   Emitter    │  │  (host capabilities)          │            │
//! │  └──────────────┘  └───────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod engine;
pub mod scheduler;
pub mod analytics;
pub mod abr;
pub mod ads;

pub use error::{Error, Result};
pub use types::*;
pub use engine::{AdMediaElement, AdMediaEvent, EngineEvent, PlaybackEngine};
pub use scheduler::{ManualScheduler, Scheduler, TimerToken, TokioScheduler};
pub use analytics::{AnalyticsEmitter, AnalyticsEvent, AnalyticsSink, NoopAnalytics};
pub use abr::{AbrHandle, AbrService, AbrTuner};
pub use ads::{AdHandle, AdOrchestrator, AdRuntime, AdSchedule, AdState, VastResolver, VmapResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the control library
pub fn init() {
    tracing::info!(version = VERSION, "Kino Control initialized");
}

//! VAST/VMAP ad-break orchestration
//!
//! Parsing ([`vast`], [`vmap`]) is pure and fetches through a [`Fetcher`].
//! [`AdOrchestrator`] is the synchronous state machine; [`AdRuntime`]
//! drives it on tokio against the host's engine and ad media element.

pub mod beacon;
pub mod model;
pub mod orchestrator;
pub mod runtime;
pub mod time;
pub mod vast;
pub mod vmap;
mod xml;

pub use beacon::{with_error_code, BeaconFirer, HttpBeaconFirer, ERROR_CODE_MACRO};
pub use model::{
    AdBreak, AdBreakKind, AdSchedule, AdsDescriptor, Companion, EndReason, HorizontalPosition,
    Icon, LinearCreative, MediaFile, MidrollDescriptor, ProgressTracking, ScheduleDescriptor,
    TimeOffset, TrackingEvent, TrackingMap, VastResponse, VerticalPosition,
};
pub use orchestrator::{
    select_media_file, AdEffect, AdInput, AdOrchestrator, AdState, BreakToken, VisibleIcon,
};
pub use runtime::{AdCommand, AdHandle, AdRuntime};
pub use vast::{
    merge_wrappers, parse_vast, Fetcher, HttpFetcher, VastDocument, VastFailure, VastResolver,
    WrapperLayer,
};
pub use vmap::{parse_time_offset, parse_vmap, VmapResolver};

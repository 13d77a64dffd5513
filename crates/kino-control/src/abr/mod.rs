//! Adaptive bitrate tuning
//!
//! Layers startup, downswitch and capping policy over the engine's own
//! adaptation. [`AbrTuner`] is the synchronous controller; [`AbrService`]
//! drives it on tokio.

pub mod caps;
pub mod estimator;
pub mod service;
pub mod tuner;

pub use caps::{viewport_bucket, viewport_cap, CapResolver, NetworkCapTable, VIEWPORT_BUCKETS};
pub use estimator::BandwidthEstimator;
pub use service::{AbrCommand, AbrHandle, AbrService};
pub use tuner::{
    select_downswitch_target, sorted_levels, AbrTuner, DownswitchDecision, ManualSelection,
};

//! Ad data model: breaks, schedules and resolved VAST creatives

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Position of a break on the content timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdBreakKind {
    Preroll,
    Midroll,
    Postroll,
}

impl fmt::Display for AdBreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdBreakKind::Preroll => write!(f, "preroll"),
            AdBreakKind::Midroll => write!(f, "midroll"),
            AdBreakKind::Postroll => write!(f, "postroll"),
        }
    }
}

/// Why a break ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Skip,
    Complete,
    Error,
}

/// Midroll offset as declared by the schedule source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOffset {
    Seconds(f64),
    /// Percentage of content duration, resolved once the duration is known
    Percent(f64),
    /// No usable position; resolved with the configured fallback fraction
    Unresolved,
}

impl TimeOffset {
    /// Absolute position, if it needs no content duration
    pub fn seconds(&self) -> Option<f64> {
        match self {
            TimeOffset::Seconds(s) => Some(*s),
            _ => None,
        }
    }

    /// Absolute position for a content of `duration` seconds, floored
    pub fn resolve(&self, duration: f64, fallback_fraction: f64) -> f64 {
        match self {
            TimeOffset::Seconds(s) => *s,
            TimeOffset::Percent(p) => (duration * p / 100.0).floor(),
            TimeOffset::Unresolved => (duration * fallback_fraction).floor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdBreak {
    /// Unique within a schedule
    pub id: String,
    pub kind: AdBreakKind,
    /// Midrolls only
    pub time_offset: Option<TimeOffset>,
    pub vast_tag_url: String,
    #[serde(default)]
    pub served: bool,
}

impl AdBreak {
    pub fn preroll(id: impl Into<String>, vast_tag_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: AdBreakKind::Preroll,
            time_offset: None,
            vast_tag_url: vast_tag_url.into(),
            served: false,
        }
    }

    pub fn midroll(
        id: impl Into<String>,
        offset: TimeOffset,
        vast_tag_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: AdBreakKind::Midroll,
            time_offset: Some(offset),
            vast_tag_url: vast_tag_url.into(),
            served: false,
        }
    }

    pub fn postroll(id: impl Into<String>, vast_tag_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: AdBreakKind::Postroll,
            time_offset: None,
            vast_tag_url: vast_tag_url.into(),
            served: false,
        }
    }

    /// Resolved midroll position in seconds
    pub fn offset_sec(&self) -> Option<f64> {
        self.time_offset.as_ref().and_then(TimeOffset::seconds)
    }
}

/// Caller-supplied ad configuration for a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdsDescriptor {
    pub vmap_url: Option<String>,
    pub schedule: Option<ScheduleDescriptor>,
}

/// Explicit break list; takes precedence over a VMAP URL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleDescriptor {
    pub preroll_tag: Option<String>,
    pub midrolls: Vec<MidrollDescriptor>,
    pub postroll_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidrollDescriptor {
    /// Seconds into the content; negative means "resolve once duration is known"
    pub at: f64,
    pub tag: String,
}

/// Ordered set of breaks keyed by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdSchedule {
    breaks: Vec<AdBreak>,
    #[serde(skip)]
    offsets_resolved: bool,
}

impl AdSchedule {
    /// Build a schedule; later breaks reusing an id are dropped
    pub fn new(breaks: Vec<AdBreak>) -> Self {
        let mut seen = HashSet::new();
        let breaks = breaks
            .into_iter()
            .filter(|b| {
                let fresh = seen.insert(b.id.clone());
                if !fresh {
                    warn!(break_id = %b.id, "Duplicate ad break id dropped");
                }
                fresh
            })
            .collect();
        Self {
            breaks,
            offsets_resolved: false,
        }
    }

    pub fn from_descriptor(descriptor: &ScheduleDescriptor) -> Self {
        let mut breaks = Vec::new();
        if let Some(tag) = descriptor.preroll_tag.as_deref().filter(|t| !t.is_empty()) {
            breaks.push(AdBreak::preroll("preroll", tag));
        }
        for (i, mid) in descriptor.midrolls.iter().enumerate() {
            let offset = if mid.at.is_finite() && mid.at >= 0.0 {
                TimeOffset::Seconds(mid.at)
            } else {
                TimeOffset::Unresolved
            };
            breaks.push(AdBreak::midroll(format!("mid_{}", i), offset, &mid.tag));
        }
        if let Some(tag) = descriptor.postroll_tag.as_deref().filter(|t| !t.is_empty()) {
            breaks.push(AdBreak::postroll("postroll", tag));
        }
        Self::new(breaks)
    }

    /// Carry `served` flags forward from a persistent served-set
    pub fn with_served(mut self, served: &HashSet<String>) -> Self {
        for b in &mut self.breaks {
            if served.contains(&b.id) {
                b.served = true;
            }
        }
        self
    }

    pub fn breaks(&self) -> &[AdBreak] {
        &self.breaks
    }

    pub fn get(&self, id: &str) -> Option<&AdBreak> {
        self.breaks.iter().find(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.breaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breaks.is_empty()
    }

    pub fn mark_served(&mut self, id: &str) {
        if let Some(b) = self.breaks.iter_mut().find(|b| b.id == id) {
            b.served = true;
        }
    }

    pub fn offsets_resolved(&self) -> bool {
        self.offsets_resolved
    }

    /// Turn deferred midroll offsets into seconds, once per schedule
    ///
    /// Returns true only on the call that performed the resolution.
    pub fn resolve_offsets(&mut self, duration: Option<f64>, fallback_fraction: f64) -> bool {
        if self.offsets_resolved {
            return false;
        }
        let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) else {
            return false;
        };

        for b in self.breaks.iter_mut().filter(|b| b.kind == AdBreakKind::Midroll) {
            if let Some(offset) = b.time_offset {
                if offset.seconds().is_none() {
                    let at = offset.resolve(duration, fallback_fraction);
                    debug!(break_id = %b.id, at, "Resolved midroll offset");
                    b.time_offset = Some(TimeOffset::Seconds(at));
                }
            }
        }
        self.offsets_resolved = true;
        true
    }

    /// Timeline markers for the UI: an unserved preroll at 0 plus every
    /// midroll with a known position
    pub fn markers(&self) -> Vec<f64> {
        let mut markers: Vec<f64> = self
            .breaks
            .iter()
            .filter_map(|b| match b.kind {
                AdBreakKind::Preroll if !b.served => Some(0.0),
                AdBreakKind::Midroll => b.offset_sec(),
                _ => None,
            })
            .collect();
        markers.sort_by(|a, b| a.total_cmp(b));
        markers
    }
}

/// VAST tracking events the orchestrator fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingEvent {
    CreativeView,
    Start,
    FirstQuartile,
    Midpoint,
    ThirdQuartile,
    Complete,
    Mute,
    Unmute,
    Pause,
    Resume,
    Skip,
    CloseLinear,
    Progress,
}

impl TrackingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingEvent::CreativeView => "creativeView",
            TrackingEvent::Start => "start",
            TrackingEvent::FirstQuartile => "firstQuartile",
            TrackingEvent::Midpoint => "midpoint",
            TrackingEvent::ThirdQuartile => "thirdQuartile",
            TrackingEvent::Complete => "complete",
            TrackingEvent::Mute => "mute",
            TrackingEvent::Unmute => "unmute",
            TrackingEvent::Pause => "pause",
            TrackingEvent::Resume => "resume",
            TrackingEvent::Skip => "skip",
            TrackingEvent::CloseLinear => "closeLinear",
            TrackingEvent::Progress => "progress",
        }
    }

    /// Event for quartile 1..=3
    pub fn quartile(n: u8) -> Option<Self> {
        match n {
            1 => Some(TrackingEvent::FirstQuartile),
            2 => Some(TrackingEvent::Midpoint),
            3 => Some(TrackingEvent::ThirdQuartile),
            _ => None,
        }
    }
}

/// Tracking URLs keyed by VAST event name
pub type TrackingMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VastResponse {
    pub impressions: Vec<String>,
    pub error_urls: Vec<String>,
    /// `None` is a valid "no playable creative" answer
    pub linear: Option<LinearCreative>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearCreative {
    pub duration_sec: f64,
    pub skip_offset_sec: Option<f64>,
    pub media_files: Vec<MediaFile>,
    pub click_through_url: Option<String>,
    pub click_tracking_urls: Vec<String>,
    pub tracking: TrackingMap,
    pub progress: Vec<ProgressTracking>,
    pub companions: Vec<Companion>,
    pub icons: Vec<Icon>,
}

impl LinearCreative {
    pub fn tracking_urls(&self, event: TrackingEvent) -> &[String] {
        self.tracking
            .get(event.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub url: String,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// kbps as declared by the ad server
    pub bitrate: Option<u32>,
}

/// Progress beacon with its offset resolved to seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressTracking {
    pub url: String,
    pub offset_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Companion {
    pub width: u32,
    pub height: u32,
    pub resource: String,
    pub click_through_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalPosition {
    Left,
    Right,
    Px(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalPosition {
    Top,
    Bottom,
    Px(i32),
}

/// Industry icon (e.g. AdChoices) overlaid on the creative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Icon {
    pub program: Option<String>,
    /// Static resource URL
    pub src: String,
    pub width: u32,
    pub height: u32,
    pub x_position: HorizontalPosition,
    pub y_position: VerticalPosition,
    pub margin: Option<u32>,
    pub offset_sec: Option<f64>,
    pub duration_sec: Option<f64>,
    pub click_through_url: Option<String>,
    pub click_tracking_urls: Vec<String>,
    pub view_tracking_urls: Vec<String>,
}

impl Icon {
    /// Visible from its offset for its duration; unset fields mean always
    pub fn is_visible_at(&self, t: f64) -> bool {
        let start = self.offset_sec.unwrap_or(0.0);
        let end = self.duration_sec.map_or(f64::INFINITY, |d| start + d);
        t >= start && t <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_ids_and_offsets() {
        let schedule = AdSchedule::from_descriptor(&ScheduleDescriptor {
            preroll_tag: Some("https://ads.example.com/pre".into()),
            midrolls: vec![
                MidrollDescriptor {
                    at: 30.0,
                    tag: "https://ads.example.com/m0".into(),
                },
                MidrollDescriptor {
                    at: -1.0,
                    tag: "https://ads.example.com/m1".into(),
                },
            ],
            postroll_tag: Some("https://ads.example.com/post".into()),
        });

        let ids: Vec<_> = schedule.breaks().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["preroll", "mid_0", "mid_1", "postroll"]);
        assert_eq!(
            schedule.get("mid_1").unwrap().time_offset,
            Some(TimeOffset::Unresolved)
        );
    }

    #[test]
    fn test_resolve_offsets_once() {
        let mut schedule = AdSchedule::new(vec![
            AdBreak::midroll("a", TimeOffset::Unresolved, "u"),
            AdBreak::midroll("b", TimeOffset::Percent(25.0), "u"),
            AdBreak::midroll("c", TimeOffset::Seconds(12.0), "u"),
        ]);

        assert!(!schedule.resolve_offsets(None, 0.5));
        assert!(!schedule.resolve_offsets(Some(f64::NAN), 0.5));
        assert!(schedule.resolve_offsets(Some(125.0), 0.5));
        assert_eq!(schedule.get("a").unwrap().offset_sec(), Some(62.0));
        assert_eq!(schedule.get("b").unwrap().offset_sec(), Some(31.0));
        assert_eq!(schedule.get("c").unwrap().offset_sec(), Some(12.0));

        assert!(!schedule.resolve_offsets(Some(600.0), 0.5));
        assert_eq!(schedule.get("a").unwrap().offset_sec(), Some(62.0));
    }

    #[test]
    fn test_duplicate_ids_dropped_and_served_carried() {
        let served: HashSet<String> = ["pre".to_string()].into_iter().collect();
        let schedule = AdSchedule::new(vec![
            AdBreak::preroll("pre", "first"),
            AdBreak::preroll("pre", "second"),
            AdBreak::postroll("post", "x"),
        ])
        .with_served(&served);

        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.get("pre").unwrap().vast_tag_url, "first");
        assert!(schedule.get("pre").unwrap().served);
        assert!(!schedule.get("post").unwrap().served);
    }

    #[test]
    fn test_markers() {
        let schedule = AdSchedule::new(vec![
            AdBreak::midroll("m2", TimeOffset::Seconds(300.0), "u"),
            AdBreak::preroll("pre", "u"),
            AdBreak::midroll("m1", TimeOffset::Seconds(120.0), "u"),
            AdBreak::midroll("m3", TimeOffset::Unresolved, "u"),
        ]);
        assert_eq!(schedule.markers(), vec![0.0, 120.0, 300.0]);
    }

    #[test]
    fn test_icon_visibility() {
        let icon = Icon {
            program: None,
            src: "https://ads.example.com/i.png".into(),
            width: 20,
            height: 20,
            x_position: HorizontalPosition::Left,
            y_position: VerticalPosition::Top,
            margin: None,
            offset_sec: Some(5.0),
            duration_sec: Some(10.0),
            click_through_url: None,
            click_tracking_urls: vec![],
            view_tracking_urls: vec![],
        };
        assert!(!icon.is_visible_at(4.9));
        assert!(icon.is_visible_at(5.0));
        assert!(icon.is_visible_at(15.0));
        assert!(!icon.is_visible_at(15.1));
    }
}

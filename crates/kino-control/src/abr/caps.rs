//! Resolution ceilings
//!
//! Up to three independent sources bound the rendition height: the player
//! viewport, the connection class and a manual user choice. The effective
//! ceiling is the minimum of whichever are present.

use crate::analytics::CapReason;
use crate::types::{NetworkClass, Viewport};
use std::collections::BTreeMap;

/// Height buckets used for the viewport cap, ascending
pub const VIEWPORT_BUCKETS: [u32; 6] = [360, 480, 720, 1080, 1440, 2160];

/// Map a measured player height to a cap bucket
///
/// Picks the largest bucket not exceeding the height, or the smallest bucket
/// for tiny players. Unknown or zero heights yield no cap.
pub fn viewport_bucket(height: f64) -> Option<u32> {
    if !height.is_finite() || height <= 0.0 {
        return None;
    }
    let h = height.ceil() as u32;
    VIEWPORT_BUCKETS
        .iter()
        .rev()
        .copied()
        .find(|bucket| h >= *bucket)
        .or(Some(VIEWPORT_BUCKETS[0]))
}

/// Connection class → height ceiling lookup
#[derive(Debug, Clone)]
pub struct NetworkCapTable {
    caps: BTreeMap<NetworkClass, u32>,
}

impl NetworkCapTable {
    /// Default table with caller overrides applied on top
    pub fn with_overrides(overrides: &BTreeMap<NetworkClass, u32>) -> Self {
        let mut table = Self::default();
        table
            .caps
            .extend(overrides.iter().map(|(class, cap)| (*class, *cap)));
        table
    }

    pub fn cap_for(&self, class: NetworkClass) -> Option<u32> {
        self.caps.get(&class).copied()
    }
}

impl Default for NetworkCapTable {
    fn default() -> Self {
        Self {
            caps: BTreeMap::from([
                (NetworkClass::Slow2g, 240),
                (NetworkClass::Cellular2g, 360),
                (NetworkClass::Cellular3g, 480),
                (NetworkClass::Cellular4g, 1080),
                (NetworkClass::Cellular5g, 2160),
            ]),
        }
    }
}

/// Last-known value of each cap source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapResolver {
    viewport: Option<u32>,
    network: Option<u32>,
    manual: Option<u32>,
}

impl CapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, source: CapReason, cap: Option<u32>) {
        let slot = match source {
            CapReason::Viewport => &mut self.viewport,
            CapReason::Network => &mut self.network,
            CapReason::Manual => &mut self.manual,
        };
        *slot = cap.filter(|c| *c > 0);
    }

    pub fn get(&self, source: CapReason) -> Option<u32> {
        match source {
            CapReason::Viewport => self.viewport,
            CapReason::Network => self.network,
            CapReason::Manual => self.manual,
        }
    }

    /// Sources currently contributing a cap, in evaluation order
    pub fn active(&self) -> Vec<(CapReason, u32)> {
        [CapReason::Viewport, CapReason::Network, CapReason::Manual]
            .into_iter()
            .filter_map(|source| self.get(source).map(|cap| (source, cap)))
            .collect()
    }

    /// Minimum over all present sources
    pub fn effective(&self) -> Option<u32> {
        self.active().into_iter().map(|(_, cap)| cap).min()
    }
}

/// Viewport cap for a full measurement (fullscreen uses the screen height)
pub fn viewport_cap(viewport: &Viewport) -> Option<u32> {
    viewport_bucket(viewport.effective_height())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_buckets() {
        assert_eq!(viewport_bucket(900.0), Some(720));
        assert_eq!(viewport_bucket(1080.0), Some(1080));
        assert_eq!(viewport_bucket(1079.2), Some(1080));
        assert_eq!(viewport_bucket(2400.0), Some(2160));
        assert_eq!(viewport_bucket(200.0), Some(360));
        assert_eq!(viewport_bucket(0.0), None);
        assert_eq!(viewport_bucket(f64::NAN), None);
    }

    #[test]
    fn test_network_table() {
        let table = NetworkCapTable::default();
        assert_eq!(table.cap_for(NetworkClass::Slow2g), Some(240));
        assert_eq!(table.cap_for(NetworkClass::Cellular3g), Some(480));
        assert_eq!(table.cap_for(NetworkClass::Cellular5g), Some(2160));

        let overrides = BTreeMap::from([(NetworkClass::Cellular4g, 720)]);
        let table = NetworkCapTable::with_overrides(&overrides);
        assert_eq!(table.cap_for(NetworkClass::Cellular4g), Some(720));
        assert_eq!(table.cap_for(NetworkClass::Cellular2g), Some(360));
    }

    #[test]
    fn test_effective_is_minimum() {
        let mut caps = CapResolver::new();
        assert_eq!(caps.effective(), None);

        caps.set(CapReason::Viewport, viewport_bucket(900.0));
        caps.set(CapReason::Network, NetworkCapTable::default().cap_for(NetworkClass::Cellular3g));
        caps.set(CapReason::Manual, Some(1080));
        assert_eq!(caps.effective(), Some(480));

        caps.set(CapReason::Network, None);
        assert_eq!(caps.effective(), Some(720));
        assert_eq!(caps.active().len(), 2);
    }
}

//! VMAP parsing into an ad schedule

use super::model::{AdBreak, AdBreakKind, AdSchedule, TimeOffset};
use super::time::{parse_clock, parse_percent};
use super::vast::Fetcher;
use super::xml::parse_document;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{info, instrument};

/// Parse a VMAP `timeOffset` into a break kind and midroll offset
///
/// Percentages stay unresolved until the content duration is known.
/// Positional (`#n`) or malformed offsets map to second 0, which never
/// triggers as a midroll.
pub fn parse_time_offset(value: &str) -> (AdBreakKind, Option<TimeOffset>) {
    match value.trim() {
        "start" => (AdBreakKind::Preroll, None),
        "end" => (AdBreakKind::Postroll, None),
        other => {
            let offset = if other.ends_with('%') {
                parse_percent(other).map_or(TimeOffset::Unresolved, TimeOffset::Percent)
            } else {
                TimeOffset::Seconds(parse_clock(other).unwrap_or(0.0).floor())
            };
            (AdBreakKind::Midroll, Some(offset))
        }
    }
}

/// Parse a VMAP document; breaks without an ad tag are skipped
pub fn parse_vmap(xml: &str) -> Result<AdSchedule> {
    let doc = parse_document(xml)?;
    if !doc.is("VMAP") {
        return Err(Error::Parse(format!("expected VMAP root, found <{}>", doc.name)));
    }

    let breaks = doc
        .find_all("AdBreak")
        .into_iter()
        .enumerate()
        .filter_map(|(i, node)| {
            let vast_tag_url = node
                .path(&["AdSource", "AdTagURI"])
                .map(|e| e.text().to_string())
                .filter(|t| !t.is_empty())?;
            let (kind, time_offset) = parse_time_offset(node.attr("timeOffset").unwrap_or("start"));
            let id = node
                .attr("breakId")
                .map(str::to_string)
                .unwrap_or_else(|| format!("break_{}", i));
            Some(AdBreak {
                id,
                kind,
                time_offset,
                vast_tag_url,
                served: false,
            })
        })
        .collect();

    Ok(AdSchedule::new(breaks))
}

/// Fetches a VMAP URL and builds its schedule
pub struct VmapResolver {
    fetcher: Arc<dyn Fetcher>,
}

impl VmapResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> Result<AdSchedule> {
        let body = self.fetcher.fetch_text(url).await?;
        let schedule = parse_vmap(&body)?;
        info!(breaks = schedule.len(), "VMAP resolved");
        Ok(schedule)
    }
}

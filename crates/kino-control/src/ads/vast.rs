//! VAST parsing and wrapper-chain resolution

use super::model::*;
use super::time::{parse_clock, parse_icon_time, parse_offset, parse_skip_offset};
use super::xml::{parse_document, Element};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

/// Text fetcher used for VAST and VMAP documents
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

/// [`Fetcher`] over HTTP
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch_text(&self, url: &str) -> Result<String> {
        debug!("Fetching ad document: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::http_status(url, status.as_u16()));
        }

        response.text().await.map_err(|e| Error::transport(url, e))
    }
}

/// URLs a wrapper contributes to the resolved creative
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WrapperLayer {
    pub error_urls: Vec<String>,
    pub impressions: Vec<String>,
    pub tracking: TrackingMap,
    pub click_tracking_urls: Vec<String>,
    /// Progress beacons with their raw offsets, resolved against the inline duration
    pub progress: Vec<(String, String)>,
}

/// One parsed VAST document
#[derive(Debug, Clone, PartialEq)]
pub enum VastDocument {
    Wrapper {
        ad_tag_uri: String,
        layer: WrapperLayer,
    },
    Inline(VastResponse),
}

/// Resolution failure, with the error URLs of every wrapper already visited
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct VastFailure {
    pub error: Error,
    pub error_urls: Vec<String>,
}

impl VastFailure {
    fn new(error: Error, layers: &[WrapperLayer]) -> Self {
        Self {
            error,
            error_urls: layers
                .iter()
                .flat_map(|l| l.error_urls.iter().cloned())
                .collect(),
        }
    }
}

/// Fetches a VAST tag and follows its wrapper chain to the inline ad
pub struct VastResolver {
    fetcher: Arc<dyn Fetcher>,
    max_wrapper_depth: Option<usize>,
    request_timeout: Option<Duration>,
}

impl VastResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            max_wrapper_depth: None,
            request_timeout: None,
        }
    }

    /// Limit the number of wrapper hops (`None` follows any depth)
    pub fn with_max_wrapper_depth(mut self, depth: Option<usize>) -> Self {
        self.max_wrapper_depth = depth;
        self
    }

    /// Bound every document fetch in the chain
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn resolve(&self, url: &str) -> Result<VastResponse> {
        self.resolve_traced(url).await.map_err(|f| f.error)
    }

    /// Resolve, keeping the wrapper error URLs on failure so they can be fired
    #[instrument(skip(self))]
    pub async fn resolve_traced(&self, url: &str) -> std::result::Result<VastResponse, VastFailure> {
        let mut layers: Vec<WrapperLayer> = Vec::new();
        let mut current = url.to_string();

        loop {
            let body = self
                .fetch(&current)
                .await
                .map_err(|e| VastFailure::new(e, &layers))?;

            match parse_vast(&body).map_err(|e| VastFailure::new(e, &layers))? {
                VastDocument::Inline(response) => {
                    info!(
                        wrappers = layers.len(),
                        has_linear = response.linear.is_some(),
                        "VAST resolved"
                    );
                    return Ok(merge_wrappers(&layers, response));
                }
                VastDocument::Wrapper { ad_tag_uri, layer } => {
                    layers.push(layer);
                    if let Some(max) = self.max_wrapper_depth {
                        if layers.len() > max {
                            return Err(VastFailure::new(
                                Error::WrapperDepthExceeded { depth: max },
                                &layers,
                            ));
                        }
                    }
                    let next = resolve_relative(&current, &ad_tag_uri);
                    debug!(depth = layers.len(), next = %next, "Following VAST wrapper");
                    current = next;
                }
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let fetch = self.fetcher.fetch_text(url);
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .unwrap_or_else(|_| Err(Error::transport(url, "request timed out"))),
            None => fetch.await,
        }
    }
}

fn resolve_relative(base: &str, target: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(target)) {
        Ok(url) => url.to_string(),
        Err(_) => target.to_string(),
    }
}

/// Prepend wrapper URLs, outermost first, onto the inline response
pub fn merge_wrappers(layers: &[WrapperLayer], inline: VastResponse) -> VastResponse {
    if layers.is_empty() {
        return inline;
    }

    let error_urls = concat_layers(layers, |l| &l.error_urls, inline.error_urls);
    let impressions = concat_layers(layers, |l| &l.impressions, inline.impressions);

    let linear = inline.linear.map(|mut linear| {
        let mut tracking = TrackingMap::new();
        for layer in layers {
            for (event, urls) in &layer.tracking {
                tracking
                    .entry(event.clone())
                    .or_default()
                    .extend(urls.iter().cloned());
            }
        }
        for (event, urls) in std::mem::take(&mut linear.tracking) {
            tracking.entry(event).or_default().extend(urls);
        }
        linear.tracking = tracking;

        linear.click_tracking_urls = concat_layers(
            layers,
            |l| &l.click_tracking_urls,
            std::mem::take(&mut linear.click_tracking_urls),
        );

        let duration = linear.duration_sec;
        let mut progress: Vec<ProgressTracking> = layers
            .iter()
            .flat_map(|l| l.progress.iter())
            .filter_map(|(raw, url)| {
                parse_offset(raw, duration).map(|offset_sec| ProgressTracking {
                    url: url.clone(),
                    offset_sec,
                })
            })
            .collect();
        progress.append(&mut linear.progress);
        linear.progress = progress;

        linear
    });

    VastResponse {
        impressions,
        error_urls,
        linear,
    }
}

fn concat_layers(
    layers: &[WrapperLayer],
    pick: impl Fn(&WrapperLayer) -> &Vec<String>,
    tail: Vec<String>,
) -> Vec<String> {
    let mut out: Vec<String> = layers.iter().flat_map(|l| pick(l).iter().cloned()).collect();
    out.extend(tail);
    out
}

/// Parse a single VAST document
pub fn parse_vast(xml: &str) -> Result<VastDocument> {
    let doc = parse_document(xml)?;
    if !doc.is("VAST") {
        return Err(Error::Parse(format!("expected VAST root, found <{}>", doc.name)));
    }

    let error_urls = doc.texts("Error");

    if let Some(wrapper) = doc.find("Wrapper") {
        if let Some(uri) = wrapper.find("VASTAdTagURI") {
            let ad_tag_uri = uri.text().to_string();
            if ad_tag_uri.is_empty() {
                return Err(Error::Parse("empty VASTAdTagURI".to_string()));
            }
            let (tracking, progress) = collect_tracking(wrapper);
            let click_tracking_urls = wrapper
                .find_all("VideoClicks")
                .into_iter()
                .flat_map(|clicks| clicks.children_named("ClickTracking"))
                .map(|e| e.text().to_string())
                .filter(|t| !t.is_empty())
                .collect();

            return Ok(VastDocument::Wrapper {
                ad_tag_uri,
                layer: WrapperLayer {
                    error_urls,
                    impressions: wrapper.texts("Impression"),
                    tracking,
                    click_tracking_urls,
                    progress,
                },
            });
        }
    }

    let impressions = doc.texts("Impression");
    let linear = doc.find("Linear").map(|linear| parse_linear(&doc, linear));

    Ok(VastDocument::Inline(VastResponse {
        impressions,
        error_urls,
        linear,
    }))
}

/// Tracking map plus raw `(offset, url)` progress entries
fn collect_tracking(scope: &Element) -> (TrackingMap, Vec<(String, String)>) {
    let mut tracking = TrackingMap::new();
    let mut progress = Vec::new();

    for node in scope.find_all("Tracking") {
        let event = node.attr("event").unwrap_or_default().trim();
        let url = node.text();
        if url.is_empty() {
            continue;
        }
        if event == TrackingEvent::Progress.as_str() {
            if let Some(offset) = node.attr("offset") {
                progress.push((offset.to_string(), url.to_string()));
            }
            continue;
        }
        tracking
            .entry(event.to_string())
            .or_default()
            .push(url.to_string());
    }

    (tracking, progress)
}

fn parse_linear(doc: &Element, linear: &Element) -> LinearCreative {
    let duration_sec = linear
        .find("Duration")
        .and_then(|d| parse_clock(d.text()))
        .unwrap_or(0.0);
    let skip_offset_sec = parse_skip_offset(linear.attr("skipoffset"), duration_sec);

    let (tracking, raw_progress) = collect_tracking(linear);
    let progress = raw_progress
        .into_iter()
        .filter_map(|(raw, url)| {
            parse_offset(&raw, duration_sec).map(|offset_sec| ProgressTracking { url, offset_sec })
        })
        .collect();

    let clicks = linear.child("VideoClicks");
    let click_through_url = clicks
        .and_then(|c| c.child("ClickThrough"))
        .map(|e| e.text().to_string())
        .filter(|t| !t.is_empty());
    let click_tracking_urls = clicks
        .map(|c| {
            c.children_named("ClickTracking")
                .map(|e| e.text().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let media_files = linear
        .find_all("MediaFile")
        .into_iter()
        .filter(|m| !m.text().is_empty())
        .map(|m| MediaFile {
            url: m.text().to_string(),
            mime_type: m.attr("type").map(|t| t.trim().to_string()),
            width: m.attr("width").and_then(parse_int),
            height: m.attr("height").and_then(parse_int),
            bitrate: m.attr("bitrate").and_then(parse_int),
        })
        .collect();

    let companions = doc
        .find_all("Companion")
        .into_iter()
        .filter_map(|c| {
            let resource = c.find("StaticResource")?.text().to_string();
            if resource.is_empty() {
                return None;
            }
            Some(Companion {
                width: c.attr("width").and_then(parse_int).unwrap_or(0),
                height: c.attr("height").and_then(parse_int).unwrap_or(0),
                resource,
                click_through_url: c
                    .find("CompanionClickThrough")
                    .map(|e| e.text().to_string())
                    .filter(|t| !t.is_empty()),
            })
        })
        .collect();

    let icons = linear
        .child("Icons")
        .map(|icons| {
            icons
                .children_named("Icon")
                .filter_map(|icon| parse_icon(icon, duration_sec))
                .collect()
        })
        .unwrap_or_default();

    LinearCreative {
        duration_sec,
        skip_offset_sec,
        media_files,
        click_through_url,
        click_tracking_urls,
        tracking,
        progress,
        companions,
        icons,
    }
}

fn parse_icon(icon: &Element, duration: f64) -> Option<Icon> {
    let src = icon.find("StaticResource")?.text().to_string();
    if src.is_empty() {
        return None;
    }

    let x_position = match icon.attr("xPosition").map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if s == "right" => HorizontalPosition::Right,
        Some(s) => parse_int(&s).map_or(HorizontalPosition::Left, HorizontalPosition::Px),
        None => HorizontalPosition::Left,
    };
    let y_position = match icon.attr("yPosition").map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if s == "bottom" => VerticalPosition::Bottom,
        Some(s) => parse_int(&s).map_or(VerticalPosition::Top, VerticalPosition::Px),
        None => VerticalPosition::Top,
    };

    let clicks = icon.child("IconClicks");

    Some(Icon {
        program: icon.attr("program").map(str::to_string),
        src,
        width: icon.attr("width").and_then(parse_int).unwrap_or(0),
        height: icon.attr("height").and_then(parse_int).unwrap_or(0),
        x_position,
        y_position,
        margin: icon.attr("margin").and_then(parse_int),
        offset_sec: parse_icon_time(icon.attr("offset"), duration),
        duration_sec: parse_icon_time(icon.attr("duration"), duration),
        click_through_url: clicks
            .and_then(|c| c.child("IconClickThrough"))
            .map(|e| e.text().to_string())
            .filter(|t| !t.is_empty()),
        click_tracking_urls: clicks
            .map(|c| {
                c.children_named("IconClickTracking")
                    .map(|e| e.text().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        view_tracking_urls: icon.texts("IconViewTracking"),
    })
}

/// Leading integer of an attribute value (`"1280px"` → 1280)
fn parse_int<T: std::str::FromStr>(value: &str) -> Option<T> {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(value.len(), |(i, _)| i);
    value[..end].parse().ok()
}

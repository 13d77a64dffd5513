//! CLI command implementations

use crate::output::{or_dash, table, to_json, OutputFormat};
use kino_control::abr::{
    select_downswitch_target, sorted_levels, viewport_bucket, CapResolver, NetworkCapTable,
};
use kino_control::ads::{select_media_file, AdBreak, HttpFetcher, VastResolver, VmapResolver};
use kino_control::analytics::CapReason;
use kino_control::{ControlConfig, Level, NetworkClass};
use serde::Serialize;
use std::sync::Arc;
use tabled::Tabled;

#[derive(Tabled)]
struct BreakRow {
    id: String,
    kind: String,
    offset: String,
    tag: String,
}

#[derive(Tabled)]
struct TrackingRow {
    event: String,
    urls: usize,
}

#[derive(Tabled)]
struct LevelRow {
    index: usize,
    id: String,
    bandwidth: String,
    target: String,
}

/// Resolve a VAST tag through its wrapper chain
pub async fn vast(
    url: &str,
    max_depth: Option<usize>,
    config: &ControlConfig,
    format: &str,
) -> anyhow::Result<()> {
    let fetcher = Arc::new(HttpFetcher::new(config.ads.request_timeout())?);
    let resolver = VastResolver::new(fetcher)
        .with_max_wrapper_depth(max_depth.or(config.ads.max_wrapper_depth));
    let response = resolver.resolve(url).await?;

    let format = OutputFormat::from(format);
    if let OutputFormat::Json = format {
        println!("{}", to_json(&response)?);
        return Ok(());
    }

    println!("VAST: {}", url);
    println!("  Impressions: {}", response.impressions.len());
    println!("  Error URLs: {}", response.error_urls.len());

    let Some(linear) = &response.linear else {
        println!("  No linear creative");
        return Ok(());
    };

    println!("  Duration: {}s", linear.duration_sec);
    println!("  Skip offset: {}", or_dash(linear.skip_offset_sec));
    println!("  Media files: {}", linear.media_files.len());
    match select_media_file(&linear.media_files) {
        Some(media) => println!(
            "  Selected: {} ({}, {} kbps)",
            media.url,
            media.mime_type.as_deref().unwrap_or("unknown"),
            or_dash(media.bitrate)
        ),
        None => println!("  Selected: none"),
    }
    println!("  Click-through: {}", or_dash(linear.click_through_url.as_deref()));
    println!("  Progress beacons: {}", linear.progress.len());
    println!("  Icons: {}", linear.icons.len());
    println!("  Companions: {}", linear.companions.len());

    let rows = linear.tracking.iter().map(|(event, urls)| TrackingRow {
        event: event.clone(),
        urls: urls.len(),
    });
    match format {
        OutputFormat::Table => println!("\n{}", table(rows)),
        _ => {
            println!("\nTracking:");
            for row in rows {
                println!("  {}: {}", row.event, row.urls);
            }
        }
    }

    Ok(())
}

/// Resolve a VMAP into a schedule
pub async fn vmap(
    url: &str,
    duration: Option<f64>,
    config: &ControlConfig,
    format: &str,
) -> anyhow::Result<()> {
    let fetcher = Arc::new(HttpFetcher::new(config.ads.request_timeout())?);
    let mut schedule = VmapResolver::new(fetcher).resolve(url).await?;
    schedule.resolve_offsets(duration, config.ads.pending_midroll_fraction);

    let format = OutputFormat::from(format);
    if let OutputFormat::Json = format {
        #[derive(Serialize)]
        struct Report<'a> {
            breaks: &'a [AdBreak],
            markers: Vec<f64>,
        }
        let report = Report {
            breaks: schedule.breaks(),
            markers: schedule.markers(),
        };
        println!("{}", to_json(&report)?);
        return Ok(());
    }

    let rows: Vec<BreakRow> = schedule
        .breaks()
        .iter()
        .map(|b| BreakRow {
            id: b.id.clone(),
            kind: b.kind.to_string(),
            offset: match b.time_offset {
                Some(offset) => offset
                    .seconds()
                    .map_or_else(|| format!("{:?}", offset), |s| format!("{}s", s)),
                None => "-".to_string(),
            },
            tag: b.vast_tag_url.clone(),
        })
        .collect();

    println!("VMAP: {} ({} breaks)", url, rows.len());
    match format {
        OutputFormat::Table => println!("{}", table(rows)),
        _ => {
            for (i, row) in rows.iter().enumerate() {
                println!("  {}. {} [{}] at {} -> {}", i + 1, row.id, row.kind, row.offset, row.tag);
            }
        }
    }
    println!("Markers: {:?}", schedule.markers());

    Ok(())
}

#[derive(Serialize)]
struct CapsReport {
    viewport: Option<u32>,
    network: Option<u32>,
    manual: Option<u32>,
    effective: Option<u32>,
}

/// Compute the resolution ceiling from its three sources
pub fn caps(
    viewport: Option<f64>,
    network: Option<&str>,
    manual: Option<u32>,
    config: &ControlConfig,
    format: &str,
) -> anyhow::Result<()> {
    let network = network.map(str::parse::<NetworkClass>).transpose()?;
    let table_caps = NetworkCapTable::with_overrides(&config.abr.net_cap_map);

    let mut resolver = CapResolver::new();
    resolver.set(CapReason::Viewport, viewport.and_then(viewport_bucket));
    resolver.set(CapReason::Network, network.and_then(|c| table_caps.cap_for(c)));
    resolver.set(CapReason::Manual, manual);

    let report = CapsReport {
        viewport: resolver.get(CapReason::Viewport),
        network: resolver.get(CapReason::Network),
        manual: resolver.get(CapReason::Manual),
        effective: resolver.effective(),
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", to_json(&report)?),
        _ => {
            println!("Resolution caps:");
            println!("  Viewport: {}", or_dash(report.viewport));
            println!("  Network: {}", or_dash(report.network));
            println!("  Manual: {}", or_dash(report.manual));
            println!("  Effective: {}", or_dash(report.effective));
        }
    }

    Ok(())
}

/// Select the downswitch target for a bandwidth ladder
pub fn downswitch(
    bandwidths: &[u64],
    bandwidth: Option<f64>,
    config: &ControlConfig,
    format: &str,
) -> anyhow::Result<()> {
    anyhow::ensure!(!bandwidths.is_empty(), "at least one level is required");

    // No heights here, so levels de-duplicate on their id
    let levels = sorted_levels(
        bandwidths
            .iter()
            .map(|bw| Level::new(bw.to_string(), 0, Some(*bw)))
            .collect(),
    );
    let safety = config.abr.downswitch_safety;
    let target = select_downswitch_target(&levels, bandwidth, safety);

    match OutputFormat::from(format) {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Report<'a> {
                threshold: Option<f64>,
                target: Option<&'a Level>,
            }
            let report = Report {
                threshold: bandwidth.map(|b| b * safety),
                target,
            };
            println!("{}", to_json(&report)?);
        }
        format => {
            let target_id = target.map(|l| l.id.as_str());
            let rows: Vec<LevelRow> = levels
                .iter()
                .enumerate()
                .map(|(index, l)| LevelRow {
                    index,
                    id: l.id.clone(),
                    bandwidth: or_dash(l.bandwidth),
                    target: if Some(l.id.as_str()) == target_id {
                        "<-".to_string()
                    } else {
                        String::new()
                    },
                })
                .collect();

            println!(
                "Threshold: {} (safety {})",
                or_dash(bandwidth.map(|b| b * safety)),
                safety
            );
            if let OutputFormat::Table = format {
                println!("{}", table(rows));
            } else {
                for row in &rows {
                    println!("  {}. {} {}bps {}", row.index, row.id, row.bandwidth, row.target);
                }
            }
        }
    }

    Ok(())
}

//! Benchmark tests for kino-control ad and ABR hot paths
//!
//! Run with: cargo bench -p kino-control

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use kino_control::abr::{select_downswitch_target, sorted_levels, viewport_bucket};
use kino_control::ads::{merge_wrappers, parse_vast, parse_vmap, VastDocument, WrapperLayer};
use kino_control::types::Level;

// ============================================================================
// Helpers
// ============================================================================

fn generate_inline(tracking_count: usize, media_count: usize) -> String {
    let tracking: String = (0..tracking_count)
        .map(|i| {
            let event = ["start", "firstQuartile", "midpoint", "thirdQuartile", "complete"][i % 5];
            format!(
                "<Tracking event=\"{}\">https://t.example.com/{}/{}</Tracking>",
                event, event, i
            )
        })
        .collect();
    let media: String = (0..media_count)
        .map(|i| {
            format!(
                "<MediaFile type=\"video/mp4\" bitrate=\"{}\" width=\"1280\" height=\"720\">https://cdn.example.com/ad_{}.mp4</MediaFile>",
                500 + i * 250,
                i
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.0"><Ad id="bench"><InLine>
  <Impression><![CDATA[https://t.example.com/imp]]></Impression>
  <Error><![CDATA[https://t.example.com/err?c=[ERRORCODE]]]></Error>
  <Creatives><Creative><Linear skipoffset="25%">
    <Duration>00:00:30</Duration>
    <TrackingEvents>{}</TrackingEvents>
    <VideoClicks><ClickThrough>https://brand.example.com</ClickThrough></VideoClicks>
    <MediaFiles>{}</MediaFiles>
  </Linear></Creative></Creatives>
</InLine></Ad></VAST>"#,
        tracking, media
    )
}

fn generate_vmap(break_count: usize) -> String {
    let breaks: String = (0..break_count)
        .map(|i| {
            format!(
                "<vmap:AdBreak timeOffset=\"00:{:02}:00\" breakId=\"mid_{}\"><vmap:AdSource><vmap:AdTagURI>https://ads.example.com/{}</vmap:AdTagURI></vmap:AdSource></vmap:AdBreak>",
                (i + 1) % 60,
                i,
                i
            )
        })
        .collect();
    format!(
        r#"<vmap:VMAP xmlns:vmap="http://www.iab.net/videosuite/vmap" version="1.0">{}</vmap:VMAP>"#,
        breaks
    )
}

fn wrapper_layers(depth: usize) -> Vec<WrapperLayer> {
    (0..depth)
        .map(|i| {
            let mut layer = WrapperLayer {
                impressions: vec![format!("https://w{}.example.com/imp", i)],
                error_urls: vec![format!("https://w{}.example.com/err", i)],
                ..Default::default()
            };
            layer
                .tracking
                .insert("start".to_string(), vec![format!("https://w{}.example.com/start", i)]);
            layer
        })
        .collect()
}

// ============================================================================
// VAST Benchmarks
// ============================================================================

fn bench_vast_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("VAST Parsing");

    for &(tracking, media) in &[(5, 1), (20, 4), (100, 10)] {
        let xml = generate_inline(tracking, media);

        group.bench_with_input(
            BenchmarkId::new("parse_inline", format!("{}_tracking_{}_media", tracking, media)),
            &xml,
            |b, xml| {
                b.iter(|| black_box(parse_vast(black_box(xml)).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_wrapper_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("VAST Wrapper Merge");

    let VastDocument::Inline(inline) = parse_vast(&generate_inline(20, 4)).unwrap() else {
        panic!("expected inline VAST");
    };

    for &depth in &[1, 3, 5, 10] {
        let layers = wrapper_layers(depth);

        group.bench_with_input(
            BenchmarkId::new("merge", format!("{}_wrappers", depth)),
            &layers,
            |b, layers| {
                b.iter(|| black_box(merge_wrappers(black_box(layers), inline.clone())));
            },
        );
    }

    group.finish();
}

fn bench_vmap_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("VMAP Parsing");

    for &count in &[1, 10, 50] {
        let xml = generate_vmap(count);

        group.bench_with_input(
            BenchmarkId::new("parse_vmap", format!("{}_breaks", count)),
            &xml,
            |b, xml| {
                b.iter(|| black_box(parse_vmap(black_box(xml)).unwrap()));
            },
        );
    }

    group.finish();
}

// ============================================================================
// ABR Benchmarks
// ============================================================================

fn bench_abr_decisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("ABR Decisions");

    let levels: Vec<Level> = (0..8)
        .map(|i| Level::new(format!("l{}", i), 240 + i * 120, Some(400_000 + i as u64 * 600_000)))
        .collect();

    group.bench_function("sorted_levels", |b| {
        b.iter(|| black_box(sorted_levels(black_box(levels.clone()))));
    });

    let sorted = sorted_levels(levels.clone());
    group.bench_function("select_downswitch_target", |b| {
        b.iter(|| black_box(select_downswitch_target(black_box(&sorted), Some(2_500_000.0), 0.8)));
    });

    group.bench_function("viewport_bucket", |b| {
        b.iter(|| black_box(viewport_bucket(black_box(900.0))));
    });

    group.finish();
}

criterion_group!(
    vast_benches,
    bench_vast_parsing,
    bench_wrapper_merge,
    bench_vmap_parsing,
);

criterion_group!(
    abr_benches,
    bench_abr_decisions,
);

criterion_main!(vast_benches, abr_benches);

//! Benchmarks for manifest rewriting
//!
//! Rewrites media playlists of typical sizes into proxy links.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use url::Url;
use vodrelay::manifest::rewrite::rewrite_manifest;
use vodrelay::manifest::LinkContext;

/// A VOD media playlist with `segments` six-second segments.
fn playlist(segments: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n");
    for i in 0..segments {
        text.push_str("#EXTINF:6.000,\n");
        text.push_str(&format!("seg-{i:05}.ts?token=abc123&exp=1700000000\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn bench_rewrite(c: &mut Criterion) {
    let base = Url::parse("https://cdn.example.com/vod/title/720p/index.m3u8").unwrap();
    let link = LinkContext {
        proxy_base: "http://127.0.0.1:5757".to_string(),
        auth_token: Some("s3cret".to_string()),
        headers_param: Some(r#"{"Referer":"https://site.example/"}"#.to_string()),
    };

    let mut group = c.benchmark_group("manifest_rewrite");
    for segments in [100, 1000, 5000] {
        let text = playlist(segments);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(segments), &text, |b, text| {
            b.iter(|| black_box(rewrite_manifest(text, &base, &link)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rewrite);
criterion_main!(benches);

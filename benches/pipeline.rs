//! Benchmarks for the heart-rate pipeline.
//!
//! Covers the decoder on its own, decode plus formatting, and the full
//! application loop fed by a fake scanner through `run_with_io`.

use clap::Parser;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use miband_listener::app::{Options, Scanner, run_with_io};
use miband_listener::{
    AdField, Advertisement, Backend, Decoder, OutputFormatter, Scan, ScanConfig, ScanError,
    ScanResult, TextFormatter,
};
use std::future::{Future, pending};
use std::pin::Pin;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn band_advertisement(heart_rate: u8) -> Advertisement {
    Advertisement::new(
        "c8:0f:10:aa:bb:cc",
        -67,
        vec![
            AdField::new(0x01, &[0x06]),
            AdField::manufacturer(0x0157, &[0x02, 0x00, 0x00, heart_rate, 0x00, 0x00, 0x00]),
            AdField::new(0x09, b"Mi Smart Band 6"),
        ],
    )
}

fn other_advertisement() -> Advertisement {
    Advertisement::new(
        "11:22:33:44:55:66",
        -80,
        vec![AdField::manufacturer(0x004C, &[0x02, 0x15, 0x00, 0x00, 0x00, 0x00])],
    )
}

/// A fake scanner that yields prepared advertisements, like the one in app.rs tests.
struct FakeScanner {
    results: Vec<ScanResult>,
}

impl Scanner for FakeScanner {
    fn start_scan(
        &self,
        _backend: Backend,
        _config: ScanConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Scan, ScanError>> + Send + '_>> {
        let results = self.results.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<ScanResult>(results.len().max(1));
            let task = tokio::spawn(async move {
                for r in results {
                    let _ = tx.send(r).await;
                }
            });
            Ok(Scan::new(rx, task))
        })
    }
}

fn bench_decode(c: &mut Criterion) {
    let decoder = Decoder::default();
    let band = band_advertisement(72);
    let other = other_advertisement();

    let mut group = c.benchmark_group("decode");
    group.bench_function("band", |b| b.iter(|| decoder.decode(black_box(&band))));
    group.bench_function("other_vendor", |b| {
        b.iter(|| decoder.decode(black_box(&other)))
    });
    group.bench_function("band_and_format", |b| {
        b.iter(|| {
            let sample = decoder.decode(black_box(&band)).unwrap().unwrap();
            TextFormatter.format(&sample)
        })
    });
    group.finish();
}

fn bench_app_pipeline(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("app_pipeline");

    for size in [1, 10, 100] {
        // Mix of band and foreign advertisements, as seen in a busy room
        let results: Vec<ScanResult> = (0..size)
            .map(|i| {
                if i % 2 == 0 {
                    Ok(band_advertisement(60 + (i % 100) as u8))
                } else {
                    Ok(other_advertisement())
                }
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &results, |b, results| {
            b.iter(|| {
                let scanner = FakeScanner {
                    results: results.clone(),
                };
                let options = Options::parse_from(["miband-listener"]);
                let mut out = Vec::<u8>::with_capacity(80 * size);
                let mut err = Vec::<u8>::new();

                rt.block_on(async {
                    run_with_io(options, &scanner, &mut out, &mut err, pending())
                        .await
                        .unwrap();
                });

                black_box(out)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_app_pipeline);
criterion_main!(benches);

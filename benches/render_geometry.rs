//! Render Geometry Benchmarks
//!
//! Pixel sizing and page stacking, plus a full single page render on the
//! simulated backend.
//!
//! Run with: `cargo bench --bench render_geometry`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use pdfium_pool::instance::render::{placements, size_for_box, size_for_dpi, stack};
use pdfium_pool::native::simulated::SampleDocument;
use pdfium_pool::native::SimulatedModule;
use pdfium_pool::{NativeInstance, OpenDocument, Page, Pdfium, RenderPageInDpi};

const A4: (f64, f64) = (595.2756, 841.8897);

/// Benchmark pixel size math
fn bench_sizing(c: &mut Criterion) {
    c.bench_function("size_for_dpi", |b| {
        b.iter(|| size_for_dpi(black_box(A4.0), black_box(A4.1), black_box(150)))
    });

    c.bench_function("size_for_box", |b| {
        b.iter(|| size_for_box(black_box(A4.0), black_box(A4.1), Some(800), Some(800)))
    });
}

/// Benchmark stacking many pages
fn bench_stack(c: &mut Criterion) {
    let mut group = c.benchmark_group("stack_pages");

    for pages in [1usize, 10, 100] {
        let sizes: Vec<_> = (0..pages).map(|_| size_for_dpi(A4.0, A4.1, 72)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(pages), &sizes, |b, sizes| {
            b.iter(|| {
                let dims: Vec<(u32, u32)> = sizes.iter().map(|s| (s.width, s.height)).collect();
                let layout = stack(&dims, 10);
                black_box(placements(sizes, &layout))
            });
        });
    }

    group.finish();
}

/// Benchmark one page render end to end
fn bench_render_page(c: &mut Criterion) {
    let mut instance = NativeInstance::new(Box::new(SimulatedModule::new())).unwrap();
    let document = instance
        .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(1).to_bytes()))
        .unwrap();

    let mut group = c.benchmark_group("render_page_in_dpi");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    for dpi in [36u32, 72] {
        group.bench_with_input(BenchmarkId::from_parameter(dpi), &dpi, |b, dpi| {
            let request = RenderPageInDpi {
                page: Page::index(document, 0),
                dpi: Some(*dpi),
            };
            b.iter(|| black_box(instance.render_page_in_dpi(&request).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sizing, bench_stack, bench_render_page);
criterion_main!(benches);

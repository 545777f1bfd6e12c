//! Pools under concurrent load, in process

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pdfium_pool::config::PoolConfig;
use pdfium_pool::native::simulated::SampleDocument;
use pdfium_pool::native::{Library, SimulatedModule};
use pdfium_pool::{
    ExclusivePool, MultiPool, NativeInstance, OpenDocument, Page, Pdfium, PdfiumError, Pool,
    RenderPageInPixels, RenderPagesInPixels,
};

fn native() -> pdfium_pool::Result<Box<dyn Pdfium>> {
    Ok(Box::new(NativeInstance::new(Box::new(SimulatedModule::new()))?))
}

#[test]
fn test_exclusive_pool_serializes_callers() {
    let library = Library::init(Box::new(SimulatedModule::new())).unwrap();
    let pool = ExclusivePool::new(&library, Duration::from_secs(1)).unwrap();
    let inside = AtomicUsize::new(0);
    let bytes = SampleDocument::a4_pages(2).to_bytes();

    thread::scope(|scope| {
        for _ in 0..6 {
            scope.spawn(|| {
                for _ in 0..5 {
                    let mut lease = pool.get_instance(Duration::from_secs(10)).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two callers inside the instance");
                    let document = lease.open_document(OpenDocument::from_bytes(bytes.clone())).unwrap();
                    lease.get_page_size(&Page::index(document, 1)).unwrap();
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    });

    pool.close().unwrap();
    assert!(library.is_closed());
}

#[test]
fn test_pools_sharing_a_library_across_threads() {
    let library = Library::init(Box::new(SimulatedModule::new())).unwrap();
    let pools: Vec<Arc<ExclusivePool>> = (0..3)
        .map(|_| Arc::new(ExclusivePool::new(&library, Duration::from_secs(1)).unwrap()))
        .collect();
    assert_eq!(library.ref_count(), 3);

    let handles: Vec<_> = pools
        .iter()
        .map(|pool| {
            let pool = Arc::clone(pool);
            thread::spawn(move || {
                let mut lease = pool.get_instance(Duration::from_secs(10)).unwrap();
                let document = lease
                    .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(1).to_bytes()))
                    .unwrap();
                lease.get_page_count(&document).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1);
    }

    for (closed, pool) in pools.iter().enumerate() {
        assert!(!library.is_closed());
        pool.close().unwrap();
        assert_eq!(library.ref_count(), 2 - closed);
    }
    assert!(library.is_closed());
}

#[test]
fn test_multi_pool_exhaustion_and_recovery() {
    let config = PoolConfig {
        size: 3,
        ..PoolConfig::default()
    };
    let pool = MultiPool::new(native, &config).unwrap();

    let leases: Vec<_> = (0..3)
        .map(|_| pool.get_instance(Duration::from_millis(50)).unwrap())
        .collect();

    let started = Instant::now();
    let err = pool.get_instance(Duration::from_millis(50)).map(|_| ()).unwrap_err();
    assert_eq!(err, PdfiumError::Timeout(Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));

    drop(leases);
    assert_eq!(pool.stats().available, 3);
    assert!(pool.get_instance(Duration::from_millis(50)).is_ok());
}

#[test]
fn test_multi_pool_renders_concurrently() {
    let config = PoolConfig {
        size: 4,
        ..PoolConfig::default()
    };
    let pool = MultiPool::new(native, &config).unwrap();
    let bytes = SampleDocument::a4_pages(3).to_bytes();

    thread::scope(|scope| {
        for worker in 0..8usize {
            let pool = &pool;
            let bytes = bytes.clone();
            scope.spawn(move || {
                let mut lease = pool.get_instance(Duration::from_secs(20)).unwrap();
                let document = lease.open_document(OpenDocument::from_bytes(bytes)).unwrap();
                let pages = (0..3)
                    .map(|index| RenderPageInPixels {
                        page: Page::index(document, index),
                        width: Some(200 + worker as u32),
                        height: None,
                    })
                    .collect();
                let rendered = lease
                    .render_pages_in_pixels(&RenderPagesInPixels { pages, padding: 4 })
                    .unwrap();
                assert_eq!(rendered.width, 200 + worker as u32);
                assert_eq!(rendered.pages.len(), 3);
                assert_eq!(rendered.pages[2].y, 2 * (rendered.pages[0].height + 4));
            });
        }
    });

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.created, 4);
    assert_eq!(stats.evicted, 0);
}

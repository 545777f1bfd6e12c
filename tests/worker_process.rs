//! Worker binary tests: real child processes over stdin/stdout

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pdfium_pool::config::{PoolConfig, PoolKind, WorkerConfig};
use pdfium_pool::native::simulated::{SampleDocument, SamplePage};
use pdfium_pool::worker::protocol::{
    Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
};
use pdfium_pool::worker::transport::{read_frame, write_frame};
use pdfium_pool::{
    Config, ImageFormat, MultiPool, OpenDocument, Page, Pdfium, PdfiumError, Pool,
    RenderOutput, RenderPageInDpi, RenderPagesInDpi, RenderRequest, RenderToFile, WorkerInstance,
};

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        command: PathBuf::from(env!("CARGO_BIN_EXE_pdfium-worker")),
        args: Vec::new(),
        call_timeout: Duration::from_secs(10),
        startup_timeout: Duration::from_secs(10),
    }
}

/// SIGKILL `pid`; false when kill(1) is not available
fn kill(pid: u32) -> bool {
    let status = Command::new("kill").arg("-9").arg(pid.to_string()).status();
    matches!(status, Ok(s) if s.success())
}

#[test]
fn test_worker_renders_and_shuts_down() {
    let mut worker = WorkerInstance::spawn(&worker_config()).unwrap();
    assert!(worker.pid().is_some());

    let bytes = SampleDocument::new()
        .page(SamplePage::a4())
        .page(SamplePage::letter().with_rotation(90))
        .to_bytes();
    let document = worker.open_document(OpenDocument::from_bytes(bytes)).unwrap();
    assert_eq!(worker.get_page_count(&document).unwrap(), 2);

    let rendered = worker
        .render_pages_in_dpi(&RenderPagesInDpi {
            pages: vec![
                RenderPageInDpi { page: Page::index(document, 0), dpi: Some(72) },
                RenderPageInDpi { page: Page::index(document, 1), dpi: Some(72) },
            ],
            padding: 10,
        })
        .unwrap();
    // the rotated letter page is 792 wide
    assert_eq!(rendered.width, 792);
    assert_eq!(rendered.height, 842 + 10 + 612);
    assert_eq!(rendered.pages[1].y, 852);

    worker.shutdown().unwrap();
    assert!(!worker.is_healthy());
}

#[test]
fn test_worker_writes_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.png");
    let mut worker = WorkerInstance::spawn(&worker_config()).unwrap();
    let document = worker
        .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(1).to_bytes()))
        .unwrap();

    let file = worker
        .render_to_file(&RenderToFile {
            request: RenderRequest::PageInDpi(RenderPageInDpi {
                page: Page::index(document, 0),
                dpi: Some(36),
            }),
            format: ImageFormat::Png,
            quality: None,
            output: RenderOutput::File(path.clone()),
        })
        .unwrap();
    assert_eq!(file.path.as_deref(), Some(path.as_path()));
    assert!(file.data.is_none());

    let image = image::open(&path).unwrap();
    assert_eq!((image.width(), image.height()), (file.width, file.height));
}

#[test]
fn test_killed_worker_is_reported_crashed() {
    let mut worker = WorkerInstance::spawn(&worker_config()).unwrap();
    let document = worker
        .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(1).to_bytes()))
        .unwrap();
    if !kill(worker.pid().unwrap()) {
        return;
    }
    thread::sleep(Duration::from_millis(100));

    let err = worker.get_page_count(&document).unwrap_err();
    assert!(matches!(err, PdfiumError::WorkerCrashed(_)), "{err:?}");
    assert!(!worker.is_healthy());
}

#[test]
fn test_worker_pool_replaces_shut_down_workers() {
    let config = Config {
        pool: PoolConfig {
            kind: PoolKind::Workers,
            size: 2,
            ..PoolConfig::default()
        },
        worker: worker_config(),
        ..Config::default()
    };
    let worker = config.worker.clone();
    let pool = MultiPool::new(
        move || -> pdfium_pool::Result<Box<dyn Pdfium>> { Ok(Box::new(WorkerInstance::spawn(&worker)?)) },
        &config.pool,
    )
    .unwrap();

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut lease = pool.get_instance(Duration::from_secs(20)).unwrap();
                let document = lease
                    .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(2).to_bytes()))
                    .unwrap();
                assert_eq!(lease.get_page_count(&document).unwrap(), 2);
            });
        }
    });
    assert_eq!(pool.stats().created, 2);

    {
        let mut lease = pool.get_instance(Duration::from_secs(5)).unwrap();
        lease.shutdown().unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.created, 3);
    assert_eq!(stats.available, 2);
    pool.close().unwrap();
}

#[test]
fn test_worker_pool_evicts_killed_worker() {
    let pool_config = PoolConfig {
        kind: PoolKind::Workers,
        size: 1,
        ..PoolConfig::default()
    };
    let worker = worker_config();
    let pids = Arc::new(Mutex::new(Vec::new()));
    let spawned = Arc::clone(&pids);
    let pool = MultiPool::new(
        move || -> pdfium_pool::Result<Box<dyn Pdfium>> {
            let instance = WorkerInstance::spawn(&worker)?;
            spawned.lock().unwrap().extend(instance.pid());
            Ok(Box::new(instance))
        },
        &pool_config,
    )
    .unwrap();
    let pid = pids.lock().unwrap()[0];

    {
        let mut lease = pool.get_instance(Duration::from_secs(5)).unwrap();
        let document = lease
            .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(1).to_bytes()))
            .unwrap();
        if !kill(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));

        let err = lease.get_page_count(&document).unwrap_err();
        assert!(matches!(err, PdfiumError::WorkerCrashed(_)), "{err:?}");
        assert!(!lease.is_healthy());
    }

    let stats = pool.stats();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.available, 1);

    // the replacement is a fresh process
    let replacement = pids.lock().unwrap()[1];
    assert_ne!(replacement, pid);
    let mut lease = pool.get_instance(Duration::from_secs(5)).unwrap();
    let document = lease
        .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(3).to_bytes()))
        .unwrap();
    assert_eq!(lease.get_page_count(&document).unwrap(), 3);
}

#[test]
fn test_worker_refuses_to_run_without_cookie() {
    let output = Command::new(env!("CARGO_BIN_EXE_pdfium-worker"))
        .env_remove(MAGIC_COOKIE_KEY)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not meant to be run directly"), "{stderr}");
}

#[test]
fn test_worker_rejects_wrong_protocol_version() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_pdfium-worker"))
        .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = child.stdout.take().unwrap();

    let hello = Handshake::Hello {
        protocol_version: PROTOCOL_VERSION + 1,
        magic_key: MAGIC_COOKIE_KEY.to_string(),
        magic_value: MAGIC_COOKIE_VALUE.to_string(),
    };
    write_frame(&mut stdin, &hello).unwrap();
    let answer: Handshake = read_frame(&mut stdout).unwrap().unwrap();
    assert!(matches!(answer, Handshake::Rejected { .. }));

    drop(stdin);
    let status = child.wait().unwrap();
    assert!(!status.success());
}

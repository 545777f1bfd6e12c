//! Host side of the channel
//!
//! [`WorkerInstance`] implements [`Pdfium`] by sending each call to a worker
//! and waiting for the matching reply. Frames are read on a dedicated thread
//! and handed over through a channel, so every call can wait with a timeout.
//!
//! A worker that misses the call timeout, hangs up or sends garbage is
//! marked crashed. The call fails with [`PdfiumError::WorkerCrashed`], later
//! calls fail the same way without touching the channel, and nothing is
//! retried.

use std::io::{BufReader, BufWriter, Read, Write};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::process::WorkerProcess;
use super::protocol::{Envelope, Handshake, Reply, Request, Response, PROTOCOL_VERSION};
use super::transport::{decode, read_frame_bytes, write_frame};
use crate::config::WorkerConfig;
use crate::error::{PdfiumError, Result};
use crate::instance::Pdfium;
use crate::types::{
    DocumentRef, FlattenResult, FlattenUsage, FsRectF, OpenDocument, Page, PageMode, PageRef,
    PageRotation, PageSize, PageSizeInPixels, RenderPageInDpi, RenderPageInPixels,
    RenderPageWithMatrix, RenderPagesInDpi, RenderPagesInPixels, RenderToFile, RenderedFile,
    RenderedPage, RenderedPages,
};

type Frame = Result<Vec<u8>>;

/// An instance living in another process
pub struct WorkerInstance {
    writer: BufWriter<Box<dyn Write + Send>>,
    frames: Receiver<Frame>,
    process: Option<WorkerProcess>,
    next_id: u64,
    call_timeout: Duration,
    crashed: Option<String>,
    closed: bool,
}

impl WorkerInstance {
    /// Start a worker process and complete the handshake
    pub fn spawn(config: &WorkerConfig) -> Result<Self> {
        let (process, stdout, stdin) = WorkerProcess::spawn(config)?;
        let mut instance = Self::connect(stdout, stdin, config.call_timeout, config.startup_timeout)?;
        info!(pid = process.id(), "worker ready");
        instance.process = Some(process);
        Ok(instance)
    }

    /// Handshake with a worker already reachable through `reader`/`writer`
    pub fn connect<R, W>(reader: R, writer: W, call_timeout: Duration, startup_timeout: Duration) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (sender, frames) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("pdfium-worker-reader".to_string())
            .spawn(move || read_loop(reader, sender))?;

        let mut instance = Self {
            writer: BufWriter::new(Box::new(writer)),
            frames,
            process: None,
            next_id: 0,
            call_timeout,
            crashed: None,
            closed: false,
        };
        if let Err(e) = instance.handshake(startup_timeout) {
            // nothing to shut down on a worker that never accepted
            instance.closed = true;
            return Err(e);
        }
        Ok(instance)
    }

    /// Process id, when this instance owns the worker process
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(WorkerProcess::id)
    }

    fn handshake(&mut self, timeout: Duration) -> Result<()> {
        write_frame(&mut self.writer, &Handshake::hello())
            .map_err(|e| PdfiumError::Handshake(format!("could not send hello: {e}")))?;

        let frame = match self.frames.recv_timeout(timeout) {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(PdfiumError::Handshake(e.to_string())),
            Err(RecvTimeoutError::Timeout) => {
                return Err(PdfiumError::Handshake(format!("no handshake reply within {timeout:?}")))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PdfiumError::Handshake("worker hung up during the handshake".into()))
            }
        };

        match decode::<Handshake>(&frame)? {
            Handshake::Accepted { protocol_version } if protocol_version == PROTOCOL_VERSION => {
                debug!(protocol_version, "handshake accepted");
                Ok(())
            }
            Handshake::Accepted { protocol_version } => Err(PdfiumError::Handshake(format!(
                "worker accepted with protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
            ))),
            Handshake::Rejected { reason } => {
                warn!(%reason, "worker rejected the handshake");
                Err(PdfiumError::Handshake(reason))
            }
            other => Err(PdfiumError::Handshake(format!("unexpected handshake frame {other:?}"))),
        }
    }

    fn crash(&mut self, reason: String) -> PdfiumError {
        error!(pid = ?self.pid(), %reason, "worker crashed");
        self.crashed = Some(reason.clone());
        if let Some(process) = self.process.as_mut() {
            process.kill();
        }
        PdfiumError::WorkerCrashed(reason)
    }

    fn call(&mut self, request: Request) -> Result<Reply> {
        if self.closed {
            return Err(PdfiumError::LibraryClosed);
        }
        if let Some(reason) = &self.crashed {
            return Err(PdfiumError::WorkerCrashed(reason.clone()));
        }

        self.next_id += 1;
        let id = self.next_id;
        match write_frame(&mut self.writer, &Envelope { id, body: &request }) {
            Ok(()) => {}
            Err(PdfiumError::Io(e)) => return Err(self.crash(format!("could not send request: {e}"))),
            Err(e) => return Err(e),
        }

        let frame = match self.frames.recv_timeout(self.call_timeout) {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(self.crash(format!("broken reply channel: {e}"))),
            Err(RecvTimeoutError::Timeout) => {
                return Err(self.crash(format!("no reply within {:?}", self.call_timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(self.crash("worker hung up".to_string()))
            }
        };

        let envelope: Envelope<Response> = match decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.crash(format!("undecodable reply: {e}"))),
        };
        if envelope.id != id {
            let reason = format!("reply id {} does not match request id {id}", envelope.id);
            self.crashed = Some(reason.clone());
            return Err(PdfiumError::Protocol(reason));
        }
        envelope.body
    }
}

fn read_loop<R: Read>(reader: R, sender: Sender<Frame>) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_frame_bytes(&mut reader) {
            Ok(Some(frame)) => {
                if sender.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("worker closed its end of the channel");
                break;
            }
            Err(e) => {
                let _ = sender.send(Err(e));
                break;
            }
        }
    }
}

fn unexpected(reply: Reply) -> PdfiumError {
    PdfiumError::Protocol(format!("unexpected reply {reply:?}"))
}

macro_rules! reply {
    ($self:ident, $request:expr, Unit) => {
        match $self.call($request)? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    };
    ($self:ident, $request:expr, $variant:ident) => {
        match $self.call($request)? {
            Reply::$variant(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    };
}

impl Pdfium for WorkerInstance {
    fn open_document(&mut self, request: OpenDocument) -> Result<DocumentRef> {
        reply!(self, Request::OpenDocument(request), Document)
    }

    fn close_document(&mut self, document: &DocumentRef) -> Result<()> {
        reply!(self, Request::CloseDocument(*document), Unit)
    }

    fn close_all_documents(&mut self) -> Result<usize> {
        reply!(self, Request::CloseAllDocuments, Count)
    }

    fn get_page_count(&mut self, document: &DocumentRef) -> Result<usize> {
        reply!(self, Request::GetPageCount(*document), Count)
    }

    fn get_file_version(&mut self, document: &DocumentRef) -> Result<i32> {
        reply!(self, Request::GetFileVersion(*document), Int)
    }

    fn get_doc_permissions(&mut self, document: &DocumentRef) -> Result<u32> {
        reply!(self, Request::GetDocPermissions(*document), UInt)
    }

    fn get_security_handler_revision(&mut self, document: &DocumentRef) -> Result<i32> {
        reply!(self, Request::GetSecurityHandlerRevision(*document), Int)
    }

    fn get_page_mode(&mut self, document: &DocumentRef) -> Result<PageMode> {
        reply!(self, Request::GetPageMode(*document), PageMode)
    }

    fn get_metadata(&mut self, document: &DocumentRef, tag: &str) -> Result<String> {
        let request = Request::GetMetadata {
            document: *document,
            tag: tag.to_string(),
        };
        reply!(self, request, Text)
    }

    fn get_trailer_ends(&mut self, document: &DocumentRef) -> Result<Vec<u32>> {
        reply!(self, Request::GetTrailerEnds(*document), Offsets)
    }

    fn load_page(&mut self, document: &DocumentRef, index: usize) -> Result<PageRef> {
        let request = Request::LoadPage {
            document: *document,
            index,
        };
        reply!(self, request, Page)
    }

    fn close_page(&mut self, page: &PageRef) -> Result<()> {
        reply!(self, Request::ClosePage(*page), Unit)
    }

    fn get_page_size(&mut self, page: &Page) -> Result<PageSize> {
        reply!(self, Request::GetPageSize(*page), PageSize)
    }

    fn get_page_size_in_pixels(&mut self, page: &Page, dpi: u32) -> Result<PageSizeInPixels> {
        reply!(self, Request::GetPageSizeInPixels { page: *page, dpi }, PageSizeInPixels)
    }

    fn get_page_rotation(&mut self, page: &Page) -> Result<PageRotation> {
        reply!(self, Request::GetPageRotation(*page), Rotation)
    }

    fn get_page_transparency(&mut self, page: &Page) -> Result<bool> {
        reply!(self, Request::GetPageTransparency(*page), Bool)
    }

    fn get_page_bounding_box(&mut self, page: &Page) -> Result<FsRectF> {
        reply!(self, Request::GetPageBoundingBox(*page), Rect)
    }

    fn get_page_text(&mut self, page: &Page) -> Result<String> {
        reply!(self, Request::GetPageText(*page), Text)
    }

    fn flatten_page(&mut self, page: &Page, usage: FlattenUsage) -> Result<FlattenResult> {
        reply!(self, Request::FlattenPage { page: *page, usage }, Flatten)
    }

    fn render_page_in_dpi(&mut self, request: &RenderPageInDpi) -> Result<RenderedPage> {
        reply!(self, Request::RenderPageInDpi(request.clone()), Rendered)
    }

    fn render_pages_in_dpi(&mut self, request: &RenderPagesInDpi) -> Result<RenderedPages> {
        reply!(self, Request::RenderPagesInDpi(request.clone()), RenderedPages)
    }

    fn render_page_in_pixels(&mut self, request: &RenderPageInPixels) -> Result<RenderedPage> {
        reply!(self, Request::RenderPageInPixels(request.clone()), Rendered)
    }

    fn render_pages_in_pixels(&mut self, request: &RenderPagesInPixels) -> Result<RenderedPages> {
        reply!(self, Request::RenderPagesInPixels(request.clone()), RenderedPages)
    }

    fn render_page_with_matrix(&mut self, request: &RenderPageWithMatrix) -> Result<RenderedPage> {
        reply!(self, Request::RenderPageWithMatrix(request.clone()), Rendered)
    }

    fn render_to_file(&mut self, request: &RenderToFile) -> Result<RenderedFile> {
        reply!(self, Request::RenderToFile(request.clone()), File)
    }

    fn is_healthy(&self) -> bool {
        self.crashed.is_none() && !self.closed
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.crashed.is_none() {
            self.call(Request::Shutdown).map(|_| ())
        } else {
            Ok(())
        };
        self.closed = true;
        if let Some(mut process) = self.process.take() {
            process.wait_or_kill();
        }
        debug!("worker instance shut down");
        result
    }
}

impl Drop for WorkerInstance {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "worker shutdown failed");
        }
    }
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("pid", &self.pid())
            .field("calls", &self.next_id)
            .field("crashed", &self.crashed)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread::JoinHandle;
    use std::time::Instant;

    use super::*;
    use crate::instance::NativeInstance;
    use crate::native::simulated::{SampleDocument, SamplePage};
    use crate::native::SimulatedModule;
    use crate::worker::server::serve;
    use crate::worker::transport::read_frame;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn connected() -> (WorkerInstance, JoinHandle<Result<()>>) {
        let (host, worker) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut instance = NativeInstance::new(Box::new(SimulatedModule::new()))?;
            let reader = worker.try_clone()?;
            serve(&mut instance, reader, worker)
        });
        let reader = host.try_clone().unwrap();
        let client = WorkerInstance::connect(reader, host, TIMEOUT, TIMEOUT).unwrap();
        (client, server)
    }

    /// A worker that accepts the handshake and then runs `behaviour`
    fn fake_worker(behaviour: impl FnOnce(&mut UnixStream) + Send + 'static) -> UnixStream {
        let (host, mut worker) = UnixStream::pair().unwrap();
        thread::spawn(move || {
            let hello: Handshake = read_frame(&mut worker).unwrap().unwrap();
            write_frame(&mut worker, &hello.answer()).unwrap();
            behaviour(&mut worker);
        });
        host
    }

    fn connect(host: UnixStream, call_timeout: Duration) -> Result<WorkerInstance> {
        let reader = host.try_clone().unwrap();
        WorkerInstance::connect(reader, host, call_timeout, TIMEOUT)
    }

    #[test]
    fn test_calls_cross_the_channel() {
        let (mut client, server) = connected();
        let bytes = SampleDocument::new()
            .metadata("Title", "Quarterly report")
            .page(SamplePage::a4().with_text("hello worker"))
            .to_bytes();

        let document = client.open_document(OpenDocument::from_bytes(bytes)).unwrap();
        assert_eq!(client.get_page_count(&document).unwrap(), 1);
        assert_eq!(client.get_metadata(&document, "Title").unwrap(), "Quarterly report");

        let page = Page::index(document, 0);
        assert_eq!(client.get_page_text(&page).unwrap(), "hello worker");

        let rendered = client
            .render_page_in_dpi(&RenderPageInDpi { page, dpi: Some(72) })
            .unwrap();
        assert_eq!((rendered.width, rendered.height), (596, 842));
        assert_eq!(rendered.image.pixels.len(), 596 * 842 * 4);

        client.shutdown().unwrap();
        assert!(!client.is_healthy());
        assert!(server.join().unwrap().is_ok());
        assert_eq!(client.get_page_count(&document), Err(PdfiumError::LibraryClosed));
    }

    #[test]
    fn test_worker_errors_are_returned_unchanged() {
        let (mut client, _server) = connected();
        let page = Page::index(DocumentRef::new(), 0);
        assert_eq!(client.get_page_size(&page), Err(PdfiumError::NoDocument));
        assert!(client.is_healthy());
    }

    #[test]
    fn test_timeout_marks_worker_crashed() {
        let host = fake_worker(|worker| {
            let _request: Option<Envelope<Request>> = read_frame(worker).unwrap();
            thread::sleep(Duration::from_millis(500));
        });
        let mut client = connect(host, Duration::from_millis(50)).unwrap();

        let err = client.get_page_count(&DocumentRef::new()).unwrap_err();
        assert!(matches!(err, PdfiumError::WorkerCrashed(ref reason) if reason.contains("no reply")));
        assert!(err.is_fatal());
        assert!(!client.is_healthy());

        // not retried: fails at once without waiting on the channel again
        let started = Instant::now();
        assert!(matches!(client.close_all_documents(), Err(PdfiumError::WorkerCrashed(_))));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_hang_up_marks_worker_crashed() {
        let host = fake_worker(|worker| {
            let _request: Option<Envelope<Request>> = read_frame(worker).unwrap();
            worker.shutdown(std::net::Shutdown::Both).unwrap();
        });
        let mut client = connect(host, TIMEOUT).unwrap();
        let err = client.get_page_count(&DocumentRef::new()).unwrap_err();
        assert!(matches!(err, PdfiumError::WorkerCrashed(_)));
    }

    #[test]
    fn test_mismatched_reply_id_is_a_protocol_error() {
        let host = fake_worker(|worker| {
            let request: Envelope<Request> = read_frame(worker).unwrap().unwrap();
            let reply: Envelope<Response> = Envelope {
                id: request.id + 1,
                body: Ok(Reply::Pong),
            };
            write_frame(worker, &reply).unwrap();
        });
        let mut client = connect(host, TIMEOUT).unwrap();
        let err = client.get_page_count(&DocumentRef::new()).unwrap_err();
        assert!(matches!(err, PdfiumError::Protocol(_)));
        assert!(!client.is_healthy());
    }

    #[test]
    fn test_silent_worker_fails_within_startup_timeout() {
        let (host, _worker) = UnixStream::pair().unwrap();
        let reader = host.try_clone().unwrap();

        let started = Instant::now();
        let err = WorkerInstance::connect(reader, host, Duration::from_secs(3), Duration::from_millis(100))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, PdfiumError::Handshake(ref reason) if reason.contains("no handshake reply")));
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_rejected_handshake_fails_connect() {
        let (host, mut worker) = UnixStream::pair().unwrap();
        thread::spawn(move || {
            let _hello: Option<Handshake> = read_frame(&mut worker).unwrap();
            let rejected = Handshake::Rejected {
                reason: "incompatible protocol version".into(),
            };
            write_frame(&mut worker, &rejected).unwrap();
        });
        let err = connect(host, TIMEOUT).unwrap_err();
        assert_eq!(err, PdfiumError::Handshake("incompatible protocol version".into()));
    }
}

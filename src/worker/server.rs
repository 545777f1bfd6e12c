//! Worker side of the channel
//!
//! Runs inside the `pdfium-worker` process: answers the handshake, then
//! executes requests one at a time on its instance until the host sends
//! `Shutdown` or closes the channel.

use std::io::{BufReader, BufWriter, Read, Write};

use tracing::{debug, info, warn};

use super::protocol::{Envelope, Handshake, Reply, Request, Response};
use super::transport::{read_frame, write_frame};
use crate::error::{PdfiumError, Result};
use crate::instance::Pdfium;

/// Serve `instance` over a byte channel
///
/// Returns once the host shut the worker down or hung up. A rejected
/// handshake is reported as [`PdfiumError::Handshake`] after the rejection
/// was sent.
pub fn serve<R: Read, W: Write>(instance: &mut dyn Pdfium, reader: R, writer: W) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let hello: Handshake = read_frame(&mut reader)?
        .ok_or_else(|| PdfiumError::Handshake("host closed the channel before the handshake".into()))?;
    let answer = hello.answer();
    write_frame(&mut writer, &answer)?;
    if let Handshake::Rejected { reason } = answer {
        warn!(%reason, "handshake rejected");
        return Err(PdfiumError::Handshake(reason));
    }
    info!("handshake accepted, serving requests");

    let mut served = 0u64;
    while let Some(Envelope { id, body }) = read_frame::<_, Envelope<Request>>(&mut reader)? {
        if body == Request::Shutdown {
            debug!(id, "shutdown requested");
            let response: Response = instance.shutdown().map(|()| Reply::Unit);
            write_frame(&mut writer, &Envelope { id, body: response })?;
            info!(served, "worker shut down by host");
            return Ok(());
        }

        let response = dispatch(instance, body);
        if let Err(e) = &response {
            debug!(id, error = %e, "request failed");
        }
        write_frame(&mut writer, &Envelope { id, body: response })?;
        served += 1;
    }

    info!(served, "host closed the channel");
    instance.shutdown()
}

/// Run one request against the instance
pub fn dispatch(instance: &mut dyn Pdfium, request: Request) -> Response {
    let reply = match request {
        Request::OpenDocument(open) => Reply::Document(instance.open_document(open)?),
        Request::CloseDocument(document) => {
            instance.close_document(&document)?;
            Reply::Unit
        }
        Request::CloseAllDocuments => Reply::Count(instance.close_all_documents()?),
        Request::GetPageCount(document) => Reply::Count(instance.get_page_count(&document)?),
        Request::GetFileVersion(document) => Reply::Int(instance.get_file_version(&document)?),
        Request::GetDocPermissions(document) => Reply::UInt(instance.get_doc_permissions(&document)?),
        Request::GetSecurityHandlerRevision(document) => {
            Reply::Int(instance.get_security_handler_revision(&document)?)
        }
        Request::GetPageMode(document) => Reply::PageMode(instance.get_page_mode(&document)?),
        Request::GetMetadata { document, tag } => Reply::Text(instance.get_metadata(&document, &tag)?),
        Request::GetTrailerEnds(document) => Reply::Offsets(instance.get_trailer_ends(&document)?),
        Request::LoadPage { document, index } => Reply::Page(instance.load_page(&document, index)?),
        Request::ClosePage(page) => {
            instance.close_page(&page)?;
            Reply::Unit
        }
        Request::GetPageSize(page) => Reply::PageSize(instance.get_page_size(&page)?),
        Request::GetPageSizeInPixels { page, dpi } => {
            Reply::PageSizeInPixels(instance.get_page_size_in_pixels(&page, dpi)?)
        }
        Request::GetPageRotation(page) => Reply::Rotation(instance.get_page_rotation(&page)?),
        Request::GetPageTransparency(page) => Reply::Bool(instance.get_page_transparency(&page)?),
        Request::GetPageBoundingBox(page) => Reply::Rect(instance.get_page_bounding_box(&page)?),
        Request::GetPageText(page) => Reply::Text(instance.get_page_text(&page)?),
        Request::FlattenPage { page, usage } => Reply::Flatten(instance.flatten_page(&page, usage)?),
        Request::RenderPageInDpi(request) => Reply::Rendered(instance.render_page_in_dpi(&request)?),
        Request::RenderPagesInDpi(request) => {
            Reply::RenderedPages(instance.render_pages_in_dpi(&request)?)
        }
        Request::RenderPageInPixels(request) => {
            Reply::Rendered(instance.render_page_in_pixels(&request)?)
        }
        Request::RenderPagesInPixels(request) => {
            Reply::RenderedPages(instance.render_pages_in_pixels(&request)?)
        }
        Request::RenderPageWithMatrix(request) => {
            Reply::Rendered(instance.render_page_with_matrix(&request)?)
        }
        Request::RenderToFile(request) => Reply::File(instance.render_to_file(&request)?),
        Request::Ping => Reply::Pong,
        Request::Shutdown => {
            instance.shutdown()?;
            Reply::Unit
        }
    };
    Ok(reply)
}

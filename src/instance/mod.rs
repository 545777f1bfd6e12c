//! PDFium instances
//!
//! An instance is one session bound to one initialised native library. It
//! is not safe for concurrent use; pools hand out exclusive leases to it.
//!
//! [`Pdfium`] is the operation surface. It is implemented in process by
//! [`NativeInstance`] and out of process by
//! [`WorkerInstance`](crate::worker::WorkerInstance), so callers never see
//! which transport they got.

mod native;
pub mod render;

pub use native::NativeInstance;

use crate::error::Result;
use crate::types::{
    DocumentRef, FlattenResult, FlattenUsage, FsRectF, OpenDocument, Page, PageMode, PageRef,
    PageRotation, PageSize, PageSizeInPixels, RenderPageInDpi, RenderPageInPixels,
    RenderPageWithMatrix, RenderPagesInDpi, RenderPagesInPixels, RenderToFile, RenderedFile,
    RenderedPage, RenderedPages,
};

/// Document, page and render operations of one instance
///
/// Document and page references are only valid on the instance that created
/// them. Page indexes are 0-based.
pub trait Pdfium: Send {
    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Load a document from bytes or a path
    fn open_document(&mut self, request: OpenDocument) -> Result<DocumentRef>;

    /// Close a document and every page loaded from it
    fn close_document(&mut self, document: &DocumentRef) -> Result<()>;

    /// Close every open document, returning how many were closed
    fn close_all_documents(&mut self) -> Result<usize>;

    fn get_page_count(&mut self, document: &DocumentRef) -> Result<usize>;

    /// PDF version as major * 10 + minor, e.g. 17 for PDF 1.7
    fn get_file_version(&mut self, document: &DocumentRef) -> Result<i32>;

    fn get_doc_permissions(&mut self, document: &DocumentRef) -> Result<u32>;

    /// Standard security handler revision, -1 when unencrypted
    fn get_security_handler_revision(&mut self, document: &DocumentRef) -> Result<i32>;

    fn get_page_mode(&mut self, document: &DocumentRef) -> Result<PageMode>;

    /// Value of an `/Info` entry such as `Title`; empty when absent
    fn get_metadata(&mut self, document: &DocumentRef, tag: &str) -> Result<String>;

    /// Byte offsets just past every `%%EOF` marker
    fn get_trailer_ends(&mut self, document: &DocumentRef) -> Result<Vec<u32>>;

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    fn load_page(&mut self, document: &DocumentRef, index: usize) -> Result<PageRef>;

    fn close_page(&mut self, page: &PageRef) -> Result<()>;

    /// Size in points
    fn get_page_size(&mut self, page: &Page) -> Result<PageSize>;

    fn get_page_size_in_pixels(&mut self, page: &Page, dpi: u32) -> Result<PageSizeInPixels>;

    fn get_page_rotation(&mut self, page: &Page) -> Result<PageRotation>;

    fn get_page_transparency(&mut self, page: &Page) -> Result<bool>;

    fn get_page_bounding_box(&mut self, page: &Page) -> Result<FsRectF>;

    fn get_page_text(&mut self, page: &Page) -> Result<String>;

    /// Merge annotations and form fields into the page content
    fn flatten_page(&mut self, page: &Page, usage: FlattenUsage) -> Result<FlattenResult>;

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    fn render_page_in_dpi(&mut self, request: &RenderPageInDpi) -> Result<RenderedPage>;

    /// Render pages stacked vertically on one transparent canvas
    fn render_pages_in_dpi(&mut self, request: &RenderPagesInDpi) -> Result<RenderedPages>;

    fn render_page_in_pixels(&mut self, request: &RenderPageInPixels) -> Result<RenderedPage>;

    fn render_pages_in_pixels(&mut self, request: &RenderPagesInPixels) -> Result<RenderedPages>;

    fn render_page_with_matrix(&mut self, request: &RenderPageWithMatrix) -> Result<RenderedPage>;

    /// Render and encode as PNG or JPEG, returned inline or written to a path
    fn render_to_file(&mut self, request: &RenderToFile) -> Result<RenderedFile>;

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// False once the instance can no longer be trusted (crashed worker,
    /// torn down library)
    fn is_healthy(&self) -> bool {
        true
    }

    /// Release every native resource; later calls fail
    fn shutdown(&mut self) -> Result<()>;
}

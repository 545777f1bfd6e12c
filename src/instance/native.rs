//! In-process instance
//!
//! Owns an [`Arena`] over one native module and the bookkeeping that maps
//! opaque references to native handles. Every pointer argument goes through
//! the arena's views, so nothing outlives the call that needed it.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::render::{self, size_for_box, size_for_dpi, StackLayout};
use super::Pdfium;
use crate::error::{NativeErrorCode, PdfiumError, Result};
use crate::memory::{Arena, FsRectF, FsSizeF};
use crate::native::{NativeModule, Value};
use crate::types::{
    Bitmap, DocumentRef, DocumentSource, FlattenResult, FlattenUsage, OpenDocument, Page,
    PageMode, PageRef, PageRotation, PageSize, PageSizeInPixels, RenderOutput, RenderPageInDpi,
    RenderPageInPixels, RenderPageWithMatrix, RenderPagesInDpi, RenderPagesInPixels,
    RenderRequest, RenderToFile, RenderedFile, RenderedPage, RenderedPages, RenderedPagesPage,
};

/// A document loaded in the native library
struct DocumentState {
    handle: i32,
    /// Buffer passed to `FPDF_LoadMemDocument`; must stay alive until close
    data: u64,
}

struct PageState {
    handle: i32,
    document: DocumentRef,
}

/// A native page handle; pages loaded just for one call are closed on drop
struct PageHandle<'a> {
    arena: &'a Arena,
    handle: i32,
    temporary: bool,
}

impl PageHandle<'_> {
    fn arg(&self) -> Value {
        Value::I32(self.handle)
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = self.arena.call("FPDF_ClosePage", &[self.arg()]) {
                warn!(handle = self.handle, error = %e, "failed to close page");
            }
        }
    }
}

/// One initialised PDFium library in this process
pub struct NativeInstance {
    arena: Arena,
    documents: HashMap<DocumentRef, DocumentState>,
    pages: HashMap<PageRef, PageState>,
    destroyed: bool,
}

impl NativeInstance {
    /// Take ownership of `module` and run `FPDF_InitLibrary`
    pub fn new(module: Box<dyn NativeModule>) -> Result<Self> {
        let arena = Arena::new(module);
        arena.call("FPDF_InitLibrary", &[])?;
        info!(backend = %arena.backend(), "PDFium library initialised");
        Ok(Self {
            arena,
            documents: HashMap::new(),
            pages: HashMap::new(),
            destroyed: false,
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn open_document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(PdfiumError::LibraryClosed);
        }
        Ok(())
    }

    fn document(&self, document: &DocumentRef) -> Result<&DocumentState> {
        self.ensure_alive()?;
        if self.documents.is_empty() {
            return Err(PdfiumError::NoDocument);
        }
        self.documents
            .get(document)
            .ok_or(PdfiumError::UnknownDocument(*document))
    }

    /// Error for a native call that signalled failure
    fn last_error(&self) -> PdfiumError {
        match self.arena.call_i32("FPDF_GetLastError", &[]) {
            Ok(code) => PdfiumError::Native(
                NativeErrorCode::from_raw(code as u32).unwrap_or(NativeErrorCode::Unknown),
            ),
            Err(e) => e,
        }
    }

    fn page_count(&self, state: &DocumentState) -> Result<usize> {
        let count = self
            .arena
            .call_i32("FPDF_GetPageCount", &[Value::I32(state.handle)])?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn check_index(&self, state: &DocumentState, index: usize) -> Result<i32> {
        let count = self.page_count(state)?;
        if index >= count {
            return Err(PdfiumError::Page { index, count });
        }
        i32::try_from(index).map_err(|_| PdfiumError::Page { index, count })
    }

    fn load_native_page(&self, state: &DocumentState, index: usize) -> Result<i32> {
        let index = self.check_index(state, index)?;
        let handle = self
            .arena
            .call_i32("FPDF_LoadPage", &[Value::I32(state.handle), Value::I32(index)])?;
        if handle == 0 {
            return Err(self.last_error());
        }
        Ok(handle)
    }

    fn open_page(&self, page: &Page) -> Result<PageHandle<'_>> {
        match page {
            Page::ByIndex { document, index } => {
                let state = self.document(document)?;
                let handle = self.load_native_page(state, *index)?;
                Ok(PageHandle {
                    arena: &self.arena,
                    handle,
                    temporary: true,
                })
            }
            Page::ByReference(reference) => {
                self.ensure_alive()?;
                let state = self
                    .pages
                    .get(reference)
                    .ok_or(PdfiumError::UnknownPage(*reference))?;
                Ok(PageHandle {
                    arena: &self.arena,
                    handle: state.handle,
                    temporary: false,
                })
            }
        }
    }

    fn page_points(&self, page: &PageHandle<'_>) -> Result<(f64, f64)> {
        let width = self.arena.call_f32("FPDF_GetPageWidthF", &[page.arg()])?;
        let height = self.arena.call_f32("FPDF_GetPageHeightF", &[page.arg()])?;
        Ok((f64::from(width), f64::from(height)))
    }

    fn render_dpi(&self, request: &RenderPageInDpi, position: Option<usize>) -> Result<RenderedPage> {
        let dpi = match request.dpi {
            Some(dpi) if dpi > 0 => dpi,
            _ => return Err(position.map_or(PdfiumError::NoDpi, PdfiumError::NoDpiForPage)),
        };
        let page = self.open_page(&request.page)?;
        let (width, height) = self.page_points(&page)?;
        let size = size_for_dpi(width, height, dpi);
        self.render_sized(&page, size)
    }

    fn render_pixels(&self, request: &RenderPageInPixels, position: Option<usize>) -> Result<RenderedPage> {
        let missing = || {
            position.map_or(PdfiumError::NoWidthOrHeight, PdfiumError::NoWidthOrHeightForPage)
        };
        if !has_side(request.width) && !has_side(request.height) {
            return Err(missing());
        }
        let page = self.open_page(&request.page)?;
        let (width, height) = self.page_points(&page)?;
        let size = size_for_box(width, height, request.width, request.height).ok_or_else(missing)?;
        self.render_sized(&page, size)
    }

    fn render_sized(&self, page: &PageHandle<'_>, size: PageSizeInPixels) -> Result<RenderedPage> {
        let image = render::render_bitmap(&self.arena, page.handle, size.width, size.height)?;
        Ok(RenderedPage {
            image,
            points_to_pixel_ratio: size.points_to_pixel_ratio,
            width: size.width,
            height: size.height,
        })
    }

    fn stack_rendered(rendered: Vec<RenderedPage>, padding: u32) -> Result<RenderedPages> {
        let sizes: Vec<PageSizeInPixels> = rendered
            .iter()
            .map(|r| PageSizeInPixels {
                width: r.width,
                height: r.height,
                points_to_pixel_ratio: r.points_to_pixel_ratio,
            })
            .collect();
        let dims: Vec<(u32, u32)> = sizes.iter().map(|s| (s.width, s.height)).collect();
        let layout: StackLayout = render::stack(&dims, padding);
        let bitmaps: Vec<Bitmap> = rendered.into_iter().map(|r| r.image).collect();
        let image = render::compose(&bitmaps, &layout)?;
        Ok(RenderedPages {
            image,
            width: layout.width,
            height: layout.height,
            pages: render::placements(&sizes, &layout),
        })
    }

    fn read_source(source: &DocumentSource) -> Result<Vec<u8>> {
        match source {
            DocumentSource::Bytes(bytes) => Ok(bytes.clone()),
            DocumentSource::Path(path) => Ok(std::fs::read(path)?),
        }
    }

    /// Two-call pattern: ask for the size, then fill a buffer of that size
    fn metadata(&self, state: &DocumentState, tag: &str) -> Result<String> {
        let tag = self.arena.c_string(tag)?;
        let needed = self.arena.call_i32(
            "FPDF_GetMetaText",
            &[Value::I32(state.handle), tag.arg(), Value::I32(0), Value::I32(0)],
        )? as u32;
        if needed <= 2 {
            return Ok(String::new());
        }

        let buffer = self.arena.array::<u8>(needed as usize)?;
        self.arena.call_i32(
            "FPDF_GetMetaText",
            &[
                Value::I32(state.handle),
                tag.arg(),
                buffer.arg(),
                Value::I32(needed as i32),
            ],
        )?;
        Ok(decode_utf16(&buffer.value()?))
    }

    fn trailer_ends(&self, state: &DocumentState) -> Result<Vec<u32>> {
        let count = self.arena.call_i32(
            "FPDF_GetTrailerEnds",
            &[Value::I32(state.handle), Value::I32(0), Value::I32(0)],
        )?;
        let count = usize::try_from(count).unwrap_or(0);
        if count == 0 {
            return Ok(Vec::new());
        }
        let ends = self.arena.array::<u32>(count)?;
        self.arena.call_i32(
            "FPDF_GetTrailerEnds",
            &[Value::I32(state.handle), ends.arg(), Value::I32(count as i32)],
        )?;
        ends.value()
    }

    fn text_of(&self, text_page: i32) -> Result<String> {
        let count = self
            .arena
            .call_i32("FPDFText_CountChars", &[Value::I32(text_page)])?;
        let count = usize::try_from(count).unwrap_or(0);
        if count == 0 {
            return Ok(String::new());
        }
        // UTF-16 units plus the terminator
        let buffer = self.arena.array::<u8>((count + 1) * 2)?;
        self.arena.call_i32(
            "FPDFText_GetText",
            &[
                Value::I32(text_page),
                Value::I32(0),
                Value::I32(count as i32),
                buffer.arg(),
            ],
        )?;
        Ok(decode_utf16(&buffer.value()?))
    }

    fn close_document_state(&self, document: &DocumentRef, state: DocumentState) -> Result<()> {
        self.arena
            .call("FPDF_CloseDocument", &[Value::I32(state.handle)])?;
        self.arena.free(state.data)?;
        debug!(%document, "document closed");
        Ok(())
    }
}

fn has_side(side: Option<u32>) -> bool {
    side.is_some_and(|v| v > 0)
}

/// Decode a NUL-terminated UTF-16LE buffer
fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

impl Pdfium for NativeInstance {
    fn open_document(&mut self, request: OpenDocument) -> Result<DocumentRef> {
        self.ensure_alive()?;
        let bytes = Self::read_source(&request.source)?;
        let data = self.arena.alloc_bytes(&bytes)?;
        let password = request
            .password
            .as_deref()
            .map(|p| self.arena.c_string(p))
            .transpose()?;
        let password_arg = password.as_ref().map_or(Value::I32(0), |p| p.arg());

        let handle = self.arena.call_i32(
            "FPDF_LoadMemDocument",
            &[data.arg(), Value::I32(bytes.len() as i32), password_arg],
        )?;
        if handle == 0 {
            return Err(self.last_error());
        }

        let reference = DocumentRef::new();
        let state = DocumentState {
            handle,
            data: data.into_raw(),
        };
        self.documents.insert(reference, state);
        debug!(document = %reference, bytes = bytes.len(), "document opened");
        Ok(reference)
    }

    fn close_document(&mut self, document: &DocumentRef) -> Result<()> {
        self.document(document)?;
        let pages: Vec<PageRef> = self
            .pages
            .iter()
            .filter(|(_, p)| p.document == *document)
            .map(|(r, _)| *r)
            .collect();
        for page in pages {
            self.close_page(&page)?;
        }
        let state = self
            .documents
            .remove(document)
            .ok_or(PdfiumError::UnknownDocument(*document))?;
        self.close_document_state(document, state)
    }

    fn close_all_documents(&mut self) -> Result<usize> {
        self.ensure_alive()?;
        let documents: Vec<DocumentRef> = self.documents.keys().copied().collect();
        for document in &documents {
            self.close_document(document)?;
        }
        Ok(documents.len())
    }

    fn get_page_count(&mut self, document: &DocumentRef) -> Result<usize> {
        let state = self.document(document)?;
        self.page_count(state)
    }

    fn get_file_version(&mut self, document: &DocumentRef) -> Result<i32> {
        let state = self.document(document)?;
        let version = self.arena.scalar::<i32>()?;
        let ok = self.arena.call_i32(
            "FPDF_GetFileVersion",
            &[Value::I32(state.handle), version.arg()],
        )?;
        if ok == 0 {
            return Err(self.last_error());
        }
        version.value()
    }

    fn get_doc_permissions(&mut self, document: &DocumentRef) -> Result<u32> {
        let state = self.document(document)?;
        let permissions = self
            .arena
            .call_i32("FPDF_GetDocPermissions", &[Value::I32(state.handle)])?;
        Ok(permissions as u32)
    }

    fn get_security_handler_revision(&mut self, document: &DocumentRef) -> Result<i32> {
        let state = self.document(document)?;
        self.arena
            .call_i32("FPDF_GetSecurityHandlerRevision", &[Value::I32(state.handle)])
    }

    fn get_page_mode(&mut self, document: &DocumentRef) -> Result<PageMode> {
        let state = self.document(document)?;
        let mode = self
            .arena
            .call_i32("FPDFDoc_GetPageMode", &[Value::I32(state.handle)])?;
        Ok(PageMode::from_raw(mode))
    }

    fn get_metadata(&mut self, document: &DocumentRef, tag: &str) -> Result<String> {
        let state = self.document(document)?;
        self.metadata(state, tag)
    }

    fn get_trailer_ends(&mut self, document: &DocumentRef) -> Result<Vec<u32>> {
        let state = self.document(document)?;
        self.trailer_ends(state)
    }

    fn load_page(&mut self, document: &DocumentRef, index: usize) -> Result<PageRef> {
        let state = self.document(document)?;
        let handle = self.load_native_page(state, index)?;
        let reference = PageRef::new();
        self.pages.insert(
            reference,
            PageState {
                handle,
                document: *document,
            },
        );
        debug!(page = %reference, index, "page loaded");
        Ok(reference)
    }

    fn close_page(&mut self, page: &PageRef) -> Result<()> {
        self.ensure_alive()?;
        let state = self
            .pages
            .remove(page)
            .ok_or(PdfiumError::UnknownPage(*page))?;
        self.arena
            .call("FPDF_ClosePage", &[Value::I32(state.handle)])?;
        Ok(())
    }

    fn get_page_size(&mut self, page: &Page) -> Result<PageSize> {
        match page {
            Page::ByIndex { document, index } => {
                let state = self.document(document)?;
                let index = self.check_index(state, *index)?;
                let size = self.arena.encode::<FsSizeF>(None)?;
                let ok = self.arena.call_i32(
                    "FPDF_GetPageSizeByIndexF",
                    &[Value::I32(state.handle), Value::I32(index), size.arg()],
                )?;
                if ok == 0 {
                    return Err(self.last_error());
                }
                let size = size.decode()?;
                Ok(PageSize {
                    width: f64::from(size.width),
                    height: f64::from(size.height),
                })
            }
            Page::ByReference(_) => {
                let handle = self.open_page(page)?;
                let (width, height) = self.page_points(&handle)?;
                Ok(PageSize { width, height })
            }
        }
    }

    fn get_page_size_in_pixels(&mut self, page: &Page, dpi: u32) -> Result<PageSizeInPixels> {
        if dpi == 0 {
            return Err(PdfiumError::NoDpi);
        }
        let (width, height) = match page {
            Page::ByIndex { document, index } => {
                let state = self.document(document)?;
                let index = self.check_index(state, *index)?;
                let width = self.arena.scalar::<f64>()?;
                let height = self.arena.scalar::<f64>()?;
                let ok = self.arena.call_i32(
                    "FPDF_GetPageSizeByIndex",
                    &[
                        Value::I32(state.handle),
                        Value::I32(index),
                        width.arg(),
                        height.arg(),
                    ],
                )?;
                if ok == 0 {
                    return Err(self.last_error());
                }
                (width.value()?, height.value()?)
            }
            Page::ByReference(_) => {
                let handle = self.open_page(page)?;
                self.page_points(&handle)?
            }
        };
        Ok(size_for_dpi(width, height, dpi))
    }

    fn get_page_rotation(&mut self, page: &Page) -> Result<PageRotation> {
        let handle = self.open_page(page)?;
        let rotation = self.arena.call_i32("FPDFPage_GetRotation", &[handle.arg()])?;
        Ok(PageRotation::from_raw(rotation))
    }

    fn get_page_transparency(&mut self, page: &Page) -> Result<bool> {
        let handle = self.open_page(page)?;
        let transparent = self
            .arena
            .call_i32("FPDFPage_HasTransparency", &[handle.arg()])?;
        Ok(transparent != 0)
    }

    fn get_page_bounding_box(&mut self, page: &Page) -> Result<FsRectF> {
        let handle = self.open_page(page)?;
        let rect = self.arena.encode::<FsRectF>(None)?;
        let ok = self
            .arena
            .call_i32("FPDF_GetPageBoundingBox", &[handle.arg(), rect.arg()])?;
        if ok == 0 {
            return Err(self.last_error());
        }
        rect.decode()
    }

    fn get_page_text(&mut self, page: &Page) -> Result<String> {
        let handle = self.open_page(page)?;
        let text_page = self.arena.call_i32("FPDFText_LoadPage", &[handle.arg()])?;
        if text_page == 0 {
            return Err(self.last_error());
        }

        let text = self.text_of(text_page);

        self.arena
            .call("FPDFText_ClosePage", &[Value::I32(text_page)])?;
        text
    }

    fn flatten_page(&mut self, page: &Page, usage: FlattenUsage) -> Result<FlattenResult> {
        let handle = self.open_page(page)?;
        let result = self.arena.call_i32(
            "FPDFPage_Flatten",
            &[handle.arg(), Value::I32(usage.as_raw())],
        )?;
        Ok(FlattenResult::from_raw(result))
    }

    fn render_page_in_dpi(&mut self, request: &RenderPageInDpi) -> Result<RenderedPage> {
        self.render_dpi(request, None)
    }

    fn render_pages_in_dpi(&mut self, request: &RenderPagesInDpi) -> Result<RenderedPages> {
        if request.pages.is_empty() {
            return Err(PdfiumError::NoPages);
        }
        if let Some(i) = request.pages.iter().position(|p| !has_side(p.dpi)) {
            return Err(PdfiumError::NoDpiForPage(i));
        }
        let rendered = request
            .pages
            .iter()
            .enumerate()
            .map(|(i, page)| self.render_dpi(page, Some(i)))
            .collect::<Result<Vec<_>>>()?;
        Self::stack_rendered(rendered, request.padding)
    }

    fn render_page_in_pixels(&mut self, request: &RenderPageInPixels) -> Result<RenderedPage> {
        self.render_pixels(request, None)
    }

    fn render_pages_in_pixels(&mut self, request: &RenderPagesInPixels) -> Result<RenderedPages> {
        if request.pages.is_empty() {
            return Err(PdfiumError::NoPages);
        }
        if let Some(i) = request
            .pages
            .iter()
            .position(|p| !has_side(p.width) && !has_side(p.height))
        {
            return Err(PdfiumError::NoWidthOrHeightForPage(i));
        }
        let rendered = request
            .pages
            .iter()
            .enumerate()
            .map(|(i, page)| self.render_pixels(page, Some(i)))
            .collect::<Result<Vec<_>>>()?;
        Self::stack_rendered(rendered, request.padding)
    }

    fn render_page_with_matrix(&mut self, request: &RenderPageWithMatrix) -> Result<RenderedPage> {
        if request.width == 0 || request.height == 0 {
            return Err(PdfiumError::NoWidthOrHeight);
        }
        let page = self.open_page(&request.page)?;
        let image = render::render_bitmap_with_matrix(
            &self.arena,
            page.handle,
            request.width,
            request.height,
            &request.matrix,
            &request.clipping,
        )?;
        Ok(RenderedPage {
            image,
            points_to_pixel_ratio: f64::from(request.matrix.a.hypot(request.matrix.b)),
            width: request.width,
            height: request.height,
        })
    }

    fn render_to_file(&mut self, request: &RenderToFile) -> Result<RenderedFile> {
        let (image, pages) = match &request.request {
            RenderRequest::PageInDpi(r) => single(self.render_page_in_dpi(r)?),
            RenderRequest::PageInPixels(r) => single(self.render_page_in_pixels(r)?),
            RenderRequest::PagesInDpi(r) => multiple(self.render_pages_in_dpi(r)?),
            RenderRequest::PagesInPixels(r) => multiple(self.render_pages_in_pixels(r)?),
        };
        let encoded = render::encode_image(&image, request.format, request.quality)?;

        let mut file = RenderedFile {
            content_type: request.format.content_type().to_string(),
            width: image.width,
            height: image.height,
            pages,
            data: None,
            path: None,
        };
        match &request.output {
            RenderOutput::Bytes => file.data = Some(encoded),
            RenderOutput::File(path) => {
                std::fs::write(path, &encoded)?;
                debug!(path = %path.display(), bytes = encoded.len(), "rendered image written");
                file.path = Some(path.clone());
            }
        }
        Ok(file)
    }

    fn is_healthy(&self) -> bool {
        !self.destroyed
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        let closed = self.close_all_documents()?;
        self.arena.call("FPDF_DestroyLibrary", &[])?;
        self.destroyed = true;
        info!(closed_documents = closed, "PDFium library destroyed");
        Ok(())
    }
}

fn single(page: RenderedPage) -> (Bitmap, Vec<RenderedPagesPage>) {
    let placement = RenderedPagesPage {
        points_to_pixel_ratio: page.points_to_pixel_ratio,
        width: page.width,
        height: page.height,
        x: 0,
        y: 0,
    };
    (page.image, vec![placement])
}

fn multiple(pages: RenderedPages) -> (Bitmap, Vec<RenderedPagesPage>) {
    (pages.image, pages.pages)
}

impl Drop for NativeInstance {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "PDFium library teardown failed");
        }
    }
}

impl std::fmt::Debug for NativeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeInstance")
            .field("arena", &self.arena)
            .field("documents", &self.documents.len())
            .field("pages", &self.pages.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

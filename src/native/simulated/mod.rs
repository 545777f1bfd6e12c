//! In-memory PDFium stand-in
//!
//! `SimulatedModule` exports the same functions as a PDFium WebAssembly build
//! and keeps every argument and result in its own linear memory, so the arena,
//! pointer views and struct codec run against it exactly as they would against
//! the real library. Documents are parsed by a small structural reader (see
//! [`SampleDocument`] for inputs) and rendering draws a deterministic page
//! frame instead of real content.
//!
//! Misuse that would crash the real library (stale handles, calls before
//! `FPDF_InitLibrary`, freeing an unknown pointer) traps instead.

mod document;

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use tracing::trace;

use super::{ModuleError, NativeModule, Value};
pub use document::{SampleDocument, SamplePage, A4, LETTER};
use document::SimDocument;

pub(crate) const ERR_SUCCESS: u32 = 0;
pub(crate) const ERR_FORMAT: u32 = 3;
pub(crate) const ERR_PASSWORD: u32 = 4;
pub(crate) const ERR_PAGE: u32 = 6;

/// Default ceiling of linear memory (512 MiB)
pub const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

const WASM_PAGE: u64 = 64 * 1024;
const INITIAL_MEMORY: u64 = 16 * WASM_PAGE;
/// First address handed out; everything below stays unused so 0 is never valid
const HEAP_BASE: u64 = 1024;
const ALIGN: u64 = 8;
const MAX_C_STRING: u64 = 64 * 1024;

const BLACK: [u8; 4] = [0x00, 0x00, 0x00, 0xFF];

type CallResult<T> = Result<T, ModuleError>;

#[derive(Debug, Clone, Copy)]
struct SimBitmap {
    width: u32,
    height: u32,
    buffer: u64,
}

impl SimBitmap {
    fn stride(&self) -> u64 {
        u64::from(self.width) * 4
    }
}

/// Axis-aligned device rectangle, right/bottom exclusive
#[derive(Debug, Clone, Copy)]
struct DeviceRect {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl DeviceRect {
    fn intersect(self, other: DeviceRect) -> DeviceRect {
        DeviceRect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
    }
}

/// In-memory implementation of [`NativeModule`]
pub struct SimulatedModule {
    memory: Vec<u8>,
    limit: u64,
    top: u64,
    live: BTreeMap<u64, u64>,
    free_blocks: BTreeMap<u64, u64>,
    initialised: bool,
    last_error: u32,
    next_handle: i32,
    documents: HashMap<i32, SimDocument>,
    pages: HashMap<i32, (i32, usize)>,
    text_pages: HashMap<i32, Vec<u16>>,
    bitmaps: HashMap<i32, SimBitmap>,
}

impl Default for SimulatedModule {
    fn default() -> Self {
        Self::with_memory_limit(DEFAULT_MEMORY_LIMIT)
    }
}

impl SimulatedModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a module whose linear memory never grows past `limit` bytes
    pub fn with_memory_limit(limit: u64) -> Self {
        let limit = limit.max(INITIAL_MEMORY);
        Self {
            memory: vec![0; INITIAL_MEMORY as usize],
            limit,
            top: HEAP_BASE,
            live: BTreeMap::new(),
            free_blocks: BTreeMap::new(),
            initialised: false,
            last_error: ERR_SUCCESS,
            next_handle: 1,
            documents: HashMap::new(),
            pages: HashMap::new(),
            text_pages: HashMap::new(),
            bitmaps: HashMap::new(),
        }
    }

    /// Number of live heap allocations
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Number of documents currently loaded
    pub fn open_documents(&self) -> usize {
        self.documents.len()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    // ------------------------------------------------------------------
    // Heap
    // ------------------------------------------------------------------

    fn malloc(&mut self, size: u64) -> u64 {
        let size = size.max(1).div_ceil(ALIGN) * ALIGN;

        let reuse = self
            .free_blocks
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(start, len)| (*start, *len));
        if let Some((start, len)) = reuse {
            self.free_blocks.remove(&start);
            if len > size {
                self.free_blocks.insert(start + size, len - size);
            }
            self.live.insert(start, size);
            return start;
        }

        let start = self.top;
        let end = match start.checked_add(size) {
            Some(end) if end <= self.limit => end,
            _ => return 0,
        };
        if end > self.memory.len() as u64 {
            let grown = end.div_ceil(WASM_PAGE) * WASM_PAGE;
            self.memory.resize(grown.min(self.limit) as usize, 0);
        }
        self.top = end;
        self.live.insert(start, size);
        start
    }

    fn free(&mut self, pointer: u64) -> CallResult<()> {
        if pointer == 0 {
            return Ok(());
        }
        let mut len = self
            .live
            .remove(&pointer)
            .ok_or_else(|| ModuleError::trap("free", format!("invalid pointer {pointer:#x}")))?;
        let mut start = pointer;

        let previous = self
            .free_blocks
            .range(..start)
            .next_back()
            .map(|(s, l)| (*s, *l));
        if let Some((prev_start, prev_len)) = previous {
            if prev_start + prev_len == start {
                self.free_blocks.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_blocks.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.top {
            self.top = start;
        } else {
            self.free_blocks.insert(start, len);
        }
        Ok(())
    }

    fn range(&self, offset: u64, len: u64) -> CallResult<Range<usize>> {
        let size = self.memory.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(ModuleError::OutOfBounds { offset, len, size }),
        }
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> CallResult<()> {
        let range = self.range(offset, bytes.len() as u64)?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }

    fn load(&self, offset: u64, len: u64) -> CallResult<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.memory[range])
    }

    fn c_string(&self, pointer: u64) -> CallResult<String> {
        let available = (self.memory.len() as u64).saturating_sub(pointer).min(MAX_C_STRING);
        let bytes = self.load(pointer, available)?;
        let end = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ModuleError::trap("c_string", "unterminated string"))?;
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn load_f32s<const N: usize>(&self, pointer: u64) -> CallResult<[f32; N]> {
        let mut out = [0f32; N];
        for (i, slot) in out.iter_mut().enumerate() {
            let bytes = self.load(pointer + i as u64 * 4, 4)?;
            *slot = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(out)
    }

    fn store_f32s(&mut self, pointer: u64, values: &[f32]) -> CallResult<()> {
        for (i, value) in values.iter().enumerate() {
            self.store(pointer + i as u64 * 4, &value.to_le_bytes())?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    fn handle(&mut self) -> i32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    fn document(&self, function: &str, handle: i32) -> CallResult<&SimDocument> {
        self.documents
            .get(&handle)
            .ok_or_else(|| ModuleError::trap(function, format!("invalid document handle {handle}")))
    }

    fn page(&self, function: &str, handle: i32) -> CallResult<&document::SimPage> {
        let (doc, index) = self
            .pages
            .get(&handle)
            .copied()
            .ok_or_else(|| ModuleError::trap(function, format!("invalid page handle {handle}")))?;
        self.document(function, doc)?
            .pages
            .get(index)
            .ok_or_else(|| ModuleError::trap(function, "page of a closed document"))
    }

    fn bitmap(&self, function: &str, handle: i32) -> CallResult<SimBitmap> {
        self.bitmaps
            .get(&handle)
            .copied()
            .ok_or_else(|| ModuleError::trap(function, format!("invalid bitmap handle {handle}")))
    }

    fn page_at(&self, function: &str, doc: i32, index: i32) -> CallResult<Option<&document::SimPage>> {
        let document = self.document(function, doc)?;
        Ok(usize::try_from(index).ok().and_then(|i| document.pages.get(i)))
    }

    // ------------------------------------------------------------------
    // Exports
    // ------------------------------------------------------------------

    fn load_mem_document(&mut self, data: u64, size: u64, password: u64) -> CallResult<Value> {
        let bytes = self.load(data, size)?.to_vec();
        let password = if password == 0 {
            None
        } else {
            Some(self.c_string(password)?)
        };
        match document::parse(&bytes, password.as_deref()) {
            Ok(doc) => {
                let handle = self.handle();
                self.documents.insert(handle, doc);
                self.last_error = ERR_SUCCESS;
                Ok(Value::I32(handle))
            }
            Err(code) => {
                self.last_error = code;
                Ok(Value::I32(0))
            }
        }
    }

    fn close_document(&mut self, handle: i32) -> CallResult<()> {
        self.documents
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| ModuleError::trap("FPDF_CloseDocument", format!("invalid document handle {handle}")))?;
        self.pages.retain(|_, (doc, _)| *doc != handle);
        Ok(())
    }

    fn get_meta_text(&mut self, doc: i32, tag: u64, buffer: u64, buflen: u64) -> CallResult<Value> {
        let tag = self.c_string(tag)?;
        let value = self
            .document("FPDF_GetMetaText", doc)?
            .info
            .get(&tag)
            .cloned()
            .unwrap_or_default();
        let encoded: Vec<u8> = value
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect();
        if buffer != 0 && buflen >= encoded.len() as u64 {
            self.store(buffer, &encoded)?;
        }
        Ok(Value::I32(encoded.len() as i32))
    }

    fn get_trailer_ends(&mut self, doc: i32, buffer: u64, length: u64) -> CallResult<Value> {
        let ends = self.document("FPDF_GetTrailerEnds", doc)?.trailer_ends.clone();
        if buffer != 0 && length >= ends.len() as u64 {
            let bytes: Vec<u8> = ends.iter().flat_map(|e| e.to_le_bytes()).collect();
            self.store(buffer, &bytes)?;
        }
        Ok(Value::I32(ends.len() as i32))
    }

    fn load_page(&mut self, doc: i32, index: i32) -> CallResult<Value> {
        if self.page_at("FPDF_LoadPage", doc, index)?.is_none() {
            self.last_error = ERR_PAGE;
            return Ok(Value::I32(0));
        }
        let handle = self.handle();
        self.pages.insert(handle, (doc, index as usize));
        Ok(Value::I32(handle))
    }

    fn flatten(&mut self, page: i32) -> CallResult<Value> {
        let (doc, index) = self
            .pages
            .get(&page)
            .copied()
            .ok_or_else(|| ModuleError::trap("FPDFPage_Flatten", format!("invalid page handle {page}")))?;
        let sim_page = self
            .documents
            .get_mut(&doc)
            .and_then(|d| d.pages.get_mut(index))
            .ok_or_else(|| ModuleError::trap("FPDFPage_Flatten", "page of a closed document"))?;
        if sim_page.annotations == 0 {
            return Ok(Value::I32(2));
        }
        sim_page.annotations = 0;
        Ok(Value::I32(1))
    }

    fn text_load_page(&mut self, page: i32) -> CallResult<Value> {
        let text: Vec<u16> = self.page("FPDFText_LoadPage", page)?.text.encode_utf16().collect();
        let handle = self.handle();
        self.text_pages.insert(handle, text);
        Ok(Value::I32(handle))
    }

    fn text_get_text(&mut self, text_page: i32, start: i32, count: i32, buffer: u64) -> CallResult<Value> {
        let units = self
            .text_pages
            .get(&text_page)
            .ok_or_else(|| ModuleError::trap("FPDFText_GetText", "invalid text page handle"))?;
        let start = usize::try_from(start).unwrap_or(0).min(units.len());
        let end = start
            .saturating_add(usize::try_from(count).unwrap_or(0))
            .min(units.len());
        let bytes: Vec<u8> = units[start..end]
            .iter()
            .copied()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect();
        self.store(buffer, &bytes)?;
        Ok(Value::I32((end - start + 1) as i32))
    }

    fn bitmap_create(&mut self, width: i32, height: i32) -> CallResult<Value> {
        let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
            return Err(ModuleError::bad_arguments("FPDFBitmap_Create", "negative size"));
        };
        if width == 0 || height == 0 {
            return Ok(Value::I32(0));
        }
        let buffer = self.malloc(u64::from(width) * u64::from(height) * 4);
        if buffer == 0 {
            return Ok(Value::I32(0));
        }
        let handle = self.handle();
        self.bitmaps.insert(handle, SimBitmap { width, height, buffer });
        Ok(Value::I32(handle))
    }

    fn bitmap_destroy(&mut self, handle: i32) -> CallResult<()> {
        let bitmap = self.bitmap("FPDFBitmap_Destroy", handle)?;
        self.bitmaps.remove(&handle);
        self.free(bitmap.buffer)
    }

    fn fill_rect(&mut self, handle: i32, rect: DeviceRect, argb: u32) -> CallResult<()> {
        let bitmap = self.bitmap("FPDFBitmap_FillRect", handle)?;
        let area = rect.intersect(full_rect(&bitmap));
        if area.left >= area.right || area.top >= area.bottom {
            return Ok(());
        }
        let [a, r, g, b] = argb.to_be_bytes();
        let row: Vec<u8> = std::iter::repeat([b, g, r, a])
            .take((area.right - area.left) as usize)
            .flatten()
            .collect();
        for y in area.top..area.bottom {
            let offset = bitmap.buffer + y as u64 * bitmap.stride() + area.left as u64 * 4;
            self.store(offset, &row)?;
        }
        Ok(())
    }

    /// Draw the one pixel outline of `frame`, limited to `clip`
    fn draw_frame(&mut self, handle: i32, frame: DeviceRect, clip: DeviceRect) -> CallResult<()> {
        let bitmap = self.bitmap("FPDF_RenderPageBitmap", handle)?;
        let clip = clip.intersect(full_rect(&bitmap));
        if frame.left >= frame.right || frame.top >= frame.bottom {
            return Ok(());
        }
        let edges = [
            DeviceRect { bottom: frame.top + 1, ..frame },
            DeviceRect { top: frame.bottom - 1, ..frame },
            DeviceRect { right: frame.left + 1, ..frame },
            DeviceRect { left: frame.right - 1, ..frame },
        ];
        for edge in edges {
            let area = edge.intersect(clip);
            for y in area.top..area.bottom {
                for x in area.left..area.right {
                    let offset = bitmap.buffer + y as u64 * bitmap.stride() + x as u64 * 4;
                    self.store(offset, &BLACK)?;
                }
            }
        }
        Ok(())
    }

    fn render_with_matrix(&mut self, bitmap: i32, page: i32, matrix: u64, clip: u64) -> CallResult<()> {
        let (width, height) = {
            let page = self.page("FPDF_RenderPageBitmapWithMatrix", page)?;
            (page.width(), page.height())
        };
        let [a, b, c, d, e, f] = self.load_f32s::<6>(matrix)?;
        let [left, top, right, bottom] = self.load_f32s::<4>(clip)?;

        let corners = [(0.0, 0.0), (width, 0.0), (0.0, height), (width, height)]
            .map(|(x, y)| (a * x + c * y + e, b * x + d * y + f));
        let xs = corners.map(|(x, _)| x);
        let ys = corners.map(|(_, y)| y);
        let min = |v: [f32; 4]| v.into_iter().fold(f32::INFINITY, f32::min);
        let max = |v: [f32; 4]| v.into_iter().fold(f32::NEG_INFINITY, f32::max);

        let frame = DeviceRect {
            left: min(xs).floor() as i64,
            top: min(ys).floor() as i64,
            right: max(xs).ceil() as i64,
            bottom: max(ys).ceil() as i64,
        };
        let clip = DeviceRect {
            left: left.floor() as i64,
            top: top.floor() as i64,
            right: right.ceil() as i64,
            bottom: bottom.ceil() as i64,
        };
        self.draw_frame(bitmap, frame, clip)
    }

    fn dispatch(&mut self, function: &str, args: &Args<'_>) -> CallResult<Option<Value>> {
        let value = match function {
            "malloc" => Value::pointer(self.malloc(args.unsigned(0)?)),
            "free" => {
                self.free(args.unsigned(0)?)?;
                return Ok(None);
            }
            "FPDF_InitLibrary" => {
                self.initialised = true;
                return Ok(None);
            }
            "FPDF_GetLastError" => Value::I32(self.last_error as i32),
            _ if !self.initialised => {
                return Err(ModuleError::trap(function, "library is not initialised"));
            }
            "FPDF_DestroyLibrary" => {
                self.initialised = false;
                self.documents.clear();
                self.pages.clear();
                self.text_pages.clear();
                return Ok(None);
            }
            "FPDF_LoadMemDocument" => {
                self.load_mem_document(args.unsigned(0)?, args.unsigned(1)?, args.unsigned(2)?)?
            }
            "FPDF_CloseDocument" => {
                self.close_document(args.int(0)?)?;
                return Ok(None);
            }
            "FPDF_GetFileVersion" => {
                let version = self.document(function, args.int(0)?)?.version;
                self.store(args.unsigned(1)?, &version.to_le_bytes())?;
                Value::I32(1)
            }
            "FPDF_GetDocPermissions" => {
                Value::I32(self.document(function, args.int(0)?)?.permissions as i32)
            }
            "FPDF_GetSecurityHandlerRevision" => {
                Value::I32(self.document(function, args.int(0)?)?.security_revision)
            }
            "FPDF_GetPageCount" => Value::I32(self.document(function, args.int(0)?)?.pages.len() as i32),
            "FPDFDoc_GetPageMode" => Value::I32(self.document(function, args.int(0)?)?.page_mode),
            "FPDF_GetMetaText" => self.get_meta_text(
                args.int(0)?,
                args.unsigned(1)?,
                args.unsigned(2)?,
                args.unsigned(3)?,
            )?,
            "FPDF_GetTrailerEnds" => {
                self.get_trailer_ends(args.int(0)?, args.unsigned(1)?, args.unsigned(2)?)?
            }
            "FPDF_LoadPage" => self.load_page(args.int(0)?, args.int(1)?)?,
            "FPDF_ClosePage" => {
                self.pages
                    .remove(&args.int(0)?)
                    .ok_or_else(|| ModuleError::trap(function, "invalid page handle"))?;
                return Ok(None);
            }
            "FPDF_GetPageSizeByIndexF" => {
                let size = self
                    .page_at(function, args.int(0)?, args.int(1)?)?
                    .map(|p| [p.width(), p.height()]);
                match size {
                    Some(size) => {
                        self.store_f32s(args.unsigned(2)?, &size)?;
                        Value::I32(1)
                    }
                    None => Value::I32(0),
                }
            }
            "FPDF_GetPageSizeByIndex" => {
                let size = self
                    .page_at(function, args.int(0)?, args.int(1)?)?
                    .map(|p| (f64::from(p.width()), f64::from(p.height())));
                match size {
                    Some((width, height)) => {
                        self.store(args.unsigned(2)?, &width.to_le_bytes())?;
                        self.store(args.unsigned(3)?, &height.to_le_bytes())?;
                        Value::I32(1)
                    }
                    None => Value::I32(0),
                }
            }
            "FPDF_GetPageWidthF" => Value::F32(self.page(function, args.int(0)?)?.width()),
            "FPDF_GetPageHeightF" => Value::F32(self.page(function, args.int(0)?)?.height()),
            "FPDFPage_GetRotation" => Value::I32(self.page(function, args.int(0)?)?.rotation),
            "FPDFPage_HasTransparency" => {
                Value::I32(i32::from(self.page(function, args.int(0)?)?.transparent))
            }
            "FPDF_GetPageBoundingBox" => {
                let [x0, y0, x1, y1] = self.page(function, args.int(0)?)?.media_box;
                self.store_f32s(args.unsigned(1)?, &[x0, y1, x1, y0])?;
                Value::I32(1)
            }
            "FPDFPage_Flatten" => self.flatten(args.int(0)?)?,
            "FPDFText_LoadPage" => self.text_load_page(args.int(0)?)?,
            "FPDFText_CountChars" => {
                let units = self
                    .text_pages
                    .get(&args.int(0)?)
                    .ok_or_else(|| ModuleError::trap(function, "invalid text page handle"))?;
                Value::I32(units.len() as i32)
            }
            "FPDFText_GetText" => self.text_get_text(
                args.int(0)?,
                args.int(1)?,
                args.int(2)?,
                args.unsigned(3)?,
            )?,
            "FPDFText_ClosePage" => {
                self.text_pages.remove(&args.int(0)?);
                return Ok(None);
            }
            "FPDFBitmap_Create" => self.bitmap_create(args.int(0)?, args.int(1)?)?,
            "FPDFBitmap_FillRect" => {
                let rect = DeviceRect {
                    left: i64::from(args.int(1)?),
                    top: i64::from(args.int(2)?),
                    right: i64::from(args.int(1)?) + i64::from(args.int(3)?),
                    bottom: i64::from(args.int(2)?) + i64::from(args.int(4)?),
                };
                self.fill_rect(args.int(0)?, rect, args.unsigned(5)? as u32)?;
                return Ok(None);
            }
            "FPDFBitmap_GetBuffer" => Value::pointer(self.bitmap(function, args.int(0)?)?.buffer),
            "FPDFBitmap_GetStride" => Value::I32(self.bitmap(function, args.int(0)?)?.stride() as i32),
            "FPDFBitmap_Destroy" => {
                self.bitmap_destroy(args.int(0)?)?;
                return Ok(None);
            }
            "FPDF_RenderPageBitmap" => {
                let bitmap = args.int(0)?;
                self.page(function, args.int(1)?)?;
                let frame = DeviceRect {
                    left: i64::from(args.int(2)?),
                    top: i64::from(args.int(3)?),
                    right: i64::from(args.int(2)?) + i64::from(args.int(4)?),
                    bottom: i64::from(args.int(3)?) + i64::from(args.int(5)?),
                };
                self.draw_frame(bitmap, frame, frame)?;
                return Ok(None);
            }
            "FPDF_RenderPageBitmapWithMatrix" => {
                self.render_with_matrix(
                    args.int(0)?,
                    args.int(1)?,
                    args.unsigned(2)?,
                    args.unsigned(3)?,
                )?;
                return Ok(None);
            }
            other => return Err(ModuleError::MissingExport(other.to_string())),
        };
        Ok(Some(value))
    }
}

fn full_rect(bitmap: &SimBitmap) -> DeviceRect {
    DeviceRect {
        left: 0,
        top: 0,
        right: i64::from(bitmap.width),
        bottom: i64::from(bitmap.height),
    }
}

/// Positional argument access with export-specific errors
struct Args<'a> {
    function: &'a str,
    values: &'a [Value],
}

impl Args<'_> {
    fn int(&self, index: usize) -> CallResult<i32> {
        self.values
            .get(index)
            .and_then(Value::as_i32)
            .ok_or_else(|| ModuleError::bad_arguments(self.function, format!("argument {index} must be i32")))
    }

    fn unsigned(&self, index: usize) -> CallResult<u64> {
        self.int(index).map(|v| u64::from(v as u32))
    }
}

impl NativeModule for SimulatedModule {
    fn name(&self) -> &str {
        "simulated"
    }

    fn call(&mut self, function: &str, args: &[Value]) -> CallResult<Vec<Value>> {
        trace!(function, args = args.len(), "native call");
        let args = Args {
            function,
            values: args,
        };
        Ok(self.dispatch(function, &args)?.into_iter().collect())
    }

    fn read_memory(&self, offset: u64, len: u64) -> CallResult<Vec<u8>> {
        self.load(offset, len).map(<[u8]>::to_vec)
    }

    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> CallResult<()> {
        self.store(offset, bytes)
    }

    fn memory_size(&self) -> u64 {
        self.memory.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(module: &mut SimulatedModule, function: &str, args: &[Value]) -> Option<Value> {
        module.call(function, args).unwrap().into_iter().next()
    }

    fn malloc(module: &mut SimulatedModule, size: i32) -> u64 {
        call(module, "malloc", &[Value::I32(size)])
            .and_then(|v| v.as_pointer())
            .unwrap()
    }

    #[test]
    fn test_malloc_never_returns_null_region() {
        let mut module = SimulatedModule::new();
        let a = malloc(&mut module, 3);
        let b = malloc(&mut module, 16);
        assert!(a >= HEAP_BASE);
        assert_eq!(a % ALIGN, 0);
        assert_eq!(b, a + ALIGN);
        assert_eq!(module.live_allocations(), 2);
    }

    #[test]
    fn test_free_coalesces_and_reuses() {
        let mut module = SimulatedModule::new();
        let a = malloc(&mut module, 32);
        let b = malloc(&mut module, 32);
        let _c = malloc(&mut module, 32);
        module.call("free", &[Value::pointer(a)]).unwrap();
        module.call("free", &[Value::pointer(b)]).unwrap();

        // a and b merged into one 64 byte block
        assert_eq!(malloc(&mut module, 64), a);
    }

    #[test]
    fn test_free_unknown_pointer_traps() {
        let mut module = SimulatedModule::new();
        let err = module.call("free", &[Value::I32(4096)]).unwrap_err();
        assert!(matches!(err, ModuleError::Trap { .. }));
        assert!(module.call("free", &[Value::I32(0)]).is_ok());
    }

    #[test]
    fn test_memory_limit_returns_null() {
        let mut module = SimulatedModule::with_memory_limit(INITIAL_MEMORY);
        assert_eq!(malloc(&mut module, (INITIAL_MEMORY * 2) as i32), 0);
    }

    #[test]
    fn test_memory_grows_on_demand() {
        let mut module = SimulatedModule::new();
        let before = module.memory_size();
        let p = malloc(&mut module, (INITIAL_MEMORY + 10) as i32);
        assert_ne!(p, 0);
        assert!(module.memory_size() > before);
        assert_eq!(module.memory_size() % WASM_PAGE, 0);
    }

    #[test]
    fn test_out_of_bounds_read() {
        let module = SimulatedModule::new();
        let err = module.read_memory(module.memory_size() - 2, 4).unwrap_err();
        assert!(matches!(err, ModuleError::OutOfBounds { len: 4, .. }));
    }

    #[test]
    fn test_document_calls_require_init() {
        let mut module = SimulatedModule::new();
        let err = module.call("FPDF_GetPageCount", &[Value::I32(1)]).unwrap_err();
        assert!(err.to_string().contains("not initialised"));
    }

    #[test]
    fn test_unknown_export() {
        let mut module = SimulatedModule::new();
        module.call("FPDF_InitLibrary", &[]).unwrap();
        let err = module.call("FPDF_DoesNotExist", &[]).unwrap_err();
        assert!(matches!(err, ModuleError::MissingExport(_)));
    }

    #[test]
    fn test_load_document_and_page_size() {
        let mut module = SimulatedModule::new();
        module.call("FPDF_InitLibrary", &[]).unwrap();

        let bytes = SampleDocument::a4_pages(2).to_bytes();
        let data = malloc(&mut module, bytes.len() as i32);
        module.write_memory(data, &bytes).unwrap();

        let doc = call(
            &mut module,
            "FPDF_LoadMemDocument",
            &[Value::pointer(data), Value::I32(bytes.len() as i32), Value::I32(0)],
        )
        .and_then(|v| v.as_i32())
        .unwrap();
        assert_ne!(doc, 0);

        let count = call(&mut module, "FPDF_GetPageCount", &[Value::I32(doc)]);
        assert_eq!(count, Some(Value::I32(2)));

        let size = malloc(&mut module, 8);
        let ok = call(
            &mut module,
            "FPDF_GetPageSizeByIndexF",
            &[Value::I32(doc), Value::I32(1), Value::pointer(size)],
        );
        assert_eq!(ok, Some(Value::I32(1)));
        let raw = module.read_memory(size, 8).unwrap();
        assert_eq!(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]), A4.0);
        assert_eq!(f32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]), A4.1);
    }

    #[test]
    fn test_load_invalid_document_sets_last_error() {
        let mut module = SimulatedModule::new();
        module.call("FPDF_InitLibrary", &[]).unwrap();
        let data = malloc(&mut module, 8);
        module.write_memory(data, b"garbage!").unwrap();

        let doc = call(
            &mut module,
            "FPDF_LoadMemDocument",
            &[Value::pointer(data), Value::I32(8), Value::I32(0)],
        );
        assert_eq!(doc, Some(Value::I32(0)));
        let err = call(&mut module, "FPDF_GetLastError", &[]);
        assert_eq!(err, Some(Value::I32(ERR_FORMAT as i32)));
    }

    #[test]
    fn test_bitmap_fill_and_frame() {
        let mut module = SimulatedModule::new();
        module.call("FPDF_InitLibrary", &[]).unwrap();
        let bytes = SampleDocument::a4_pages(1).to_bytes();
        let data = malloc(&mut module, bytes.len() as i32);
        module.write_memory(data, &bytes).unwrap();
        let doc = call(
            &mut module,
            "FPDF_LoadMemDocument",
            &[Value::pointer(data), Value::I32(bytes.len() as i32), Value::I32(0)],
        )
        .unwrap();
        let page = call(&mut module, "FPDF_LoadPage", &[doc, Value::I32(0)]).unwrap();

        let bitmap = call(
            &mut module,
            "FPDFBitmap_Create",
            &[Value::I32(4), Value::I32(4), Value::I32(1)],
        )
        .unwrap();
        module
            .call(
                "FPDFBitmap_FillRect",
                &[bitmap, Value::I32(0), Value::I32(0), Value::I32(4), Value::I32(4), Value::I32(-1)],
            )
            .unwrap();
        module
            .call(
                "FPDF_RenderPageBitmap",
                &[
                    bitmap,
                    page,
                    Value::I32(0),
                    Value::I32(0),
                    Value::I32(4),
                    Value::I32(4),
                    Value::I32(0),
                    Value::I32(0),
                ],
            )
            .unwrap();

        let buffer = call(&mut module, "FPDFBitmap_GetBuffer", &[bitmap])
            .and_then(|v| v.as_pointer())
            .unwrap();
        let pixels = module.read_memory(buffer, 64).unwrap();
        assert_eq!(&pixels[0..4], &BLACK);
        // pixel (1, 1) is inside the frame
        assert_eq!(&pixels[20..24], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let live = module.live_allocations();
        module.call("FPDFBitmap_Destroy", &[bitmap]).unwrap();
        assert_eq!(module.live_allocations(), live - 1);
    }
}

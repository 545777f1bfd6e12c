//! Request, response and reference types
//!
//! These are shared by the in-process instance and the worker protocol, so
//! everything here is serde serializable. Pixel and document buffers are
//! base64 encoded when serialized.

use std::fmt;
use std::path::PathBuf;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::memory::{FsMatrix, FsRectF, FsSizeF};

/// Handle to a document opened in one specific instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(Uuid);

impl DocumentRef {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "document:{}", self.0)
    }
}

/// Handle to a page loaded in one specific instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageRef(Uuid);

impl PageRef {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

/// Page locator: by 0-based index, or through an already loaded page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Page {
    ByIndex { document: DocumentRef, index: usize },
    ByReference(PageRef),
}

impl Page {
    pub fn index(document: DocumentRef, index: usize) -> Self {
        Page::ByIndex { document, index }
    }
}

impl From<PageRef> for Page {
    fn from(page: PageRef) -> Self {
        Page::ByReference(page)
    }
}

/// Where document bytes come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentSource {
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Read by the instance; for workers the path is resolved in the worker process
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocument {
    pub source: DocumentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl OpenDocument {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: DocumentSource::Bytes(bytes.into()),
            password: None,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: DocumentSource::Path(path.into()),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Page size in points (1/72 inch)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSizeInPixels {
    pub width: u32,
    pub height: u32,
    pub points_to_pixel_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageMode {
    UseNone,
    UseOutlines,
    UseThumbs,
    FullScreen,
    UseOc,
    UseAttachments,
    Unknown,
}

impl PageMode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::UseNone,
            1 => Self::UseOutlines,
            2 => Self::UseThumbs,
            3 => Self::FullScreen,
            4 => Self::UseOc,
            5 => Self::UseAttachments,
            _ => Self::Unknown,
        }
    }
}

/// Clockwise page rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageRotation {
    None,
    Degrees90,
    Degrees180,
    Degrees270,
}

impl PageRotation {
    pub fn from_raw(raw: i32) -> Self {
        match raw.rem_euclid(4) {
            1 => Self::Degrees90,
            2 => Self::Degrees180,
            3 => Self::Degrees270,
            _ => Self::None,
        }
    }

    pub fn degrees(&self) -> u16 {
        match self {
            Self::None => 0,
            Self::Degrees90 => 90,
            Self::Degrees180 => 180,
            Self::Degrees270 => 270,
        }
    }
}

/// What flattening targets (`FLAT_NORMALDISPLAY` / `FLAT_PRINT`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlattenUsage {
    #[default]
    NormalDisplay,
    Print,
}

impl FlattenUsage {
    pub fn as_raw(&self) -> i32 {
        match self {
            Self::NormalDisplay => 0,
            Self::Print => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlattenResult {
    Fail,
    Success,
    NothingToDo,
}

impl FlattenResult {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Success,
            2 => Self::NothingToDo,
            _ => Self::Fail,
        }
    }
}

/// Render one page at a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPageInDpi {
    pub page: Page,
    /// Dots per inch; `None` or 0 is rejected
    pub dpi: Option<u32>,
}

/// Render several pages at a resolution, stacked vertically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPagesInDpi {
    pub pages: Vec<RenderPageInDpi>,
    /// Vertical gap between pages, in pixels
    pub padding: u32,
}

/// Render one page into a pixel box, keeping its aspect ratio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPageInPixels {
    pub page: Page,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPagesInPixels {
    pub pages: Vec<RenderPageInPixels>,
    pub padding: u32,
}

/// Render through an explicit page-to-device transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPageWithMatrix {
    pub page: Page,
    pub width: u32,
    pub height: u32,
    pub matrix: FsMatrix,
    /// Device-space clip rectangle
    pub clipping: FsRectF,
}

/// Any render request that produces a bitmap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderRequest {
    PageInDpi(RenderPageInDpi),
    PagesInDpi(RenderPagesInDpi),
    PageInPixels(RenderPageInPixels),
    PagesInPixels(RenderPagesInPixels),
}

/// Image output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderOutput {
    /// Return the encoded image in the response
    Bytes,
    /// Write the encoded image to this path
    File(PathBuf),
}

/// Render and encode to PNG or JPEG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderToFile {
    pub request: RenderRequest,
    pub format: ImageFormat,
    /// JPEG quality 1..=100, default 85
    pub quality: Option<u8>,
    pub output: RenderOutput,
}

/// An RGBA8 bitmap, rows packed without padding
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    #[serde(with = "base64_bytes")]
    pub pixels: Vec<u8>,
}

impl Bitmap {
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        }
    }

    /// RGBA value at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize * self.width as usize) + x as usize) * 4;
        let px = self.pixels.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPage {
    pub image: Bitmap,
    pub points_to_pixel_ratio: f64,
    pub width: u32,
    pub height: u32,
}

/// Placement of one page inside a composite
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPagesPage {
    pub points_to_pixel_ratio: f64,
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPages {
    pub image: Bitmap,
    pub width: u32,
    pub height: u32,
    pub pages: Vec<RenderedPagesPage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedFile {
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub pages: Vec<RenderedPagesPage>,
    /// Encoded image when rendering to bytes
    #[serde(default, with = "base64_option", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Output path when rendering to a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_option {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

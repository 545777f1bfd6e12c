//! Messages exchanged between the host and a worker process.
//!
//! The first frame in each direction is a [`Handshake`]. After that the host
//! sends `Envelope<Request>` frames and the worker answers each with an
//! `Envelope<Response>` carrying the same id.

use serde::{Deserialize, Serialize};

use crate::error::PdfiumError;
use crate::types::{
    DocumentRef, FlattenResult, FlattenUsage, FsRectF, OpenDocument, Page, PageMode, PageRef,
    PageRotation, PageSize, PageSizeInPixels, RenderPageInDpi, RenderPageInPixels,
    RenderPageWithMatrix, RenderPagesInDpi, RenderPagesInPixels, RenderToFile, RenderedFile,
    RenderedPage, RenderedPages,
};

/// Bumped whenever a message changes shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable the worker expects to find set to [`MAGIC_COOKIE_VALUE`]
///
/// This only stops people from running the worker binary by hand; it is not
/// a security measure.
pub const MAGIC_COOKIE_KEY: &str = "BASIC_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "hello";

/// Startup negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handshake {
    /// Host to worker.
    Hello {
        protocol_version: u32,
        magic_key: String,
        magic_value: String,
    },
    /// Worker to host; calls may follow.
    Accepted { protocol_version: u32 },
    /// Worker to host; the worker exits after sending it.
    Rejected { reason: String },
}

impl Handshake {
    /// The hello this build of the host sends
    pub fn hello() -> Self {
        Handshake::Hello {
            protocol_version: PROTOCOL_VERSION,
            magic_key: MAGIC_COOKIE_KEY.to_string(),
            magic_value: MAGIC_COOKIE_VALUE.to_string(),
        }
    }

    /// Worker-side answer to a received frame
    pub fn answer(&self) -> Handshake {
        match self {
            Handshake::Hello {
                protocol_version,
                magic_key,
                magic_value,
            } => {
                if magic_key != MAGIC_COOKIE_KEY || magic_value != MAGIC_COOKIE_VALUE {
                    Handshake::Rejected {
                        reason: "magic cookie mismatch".to_string(),
                    }
                } else if *protocol_version != PROTOCOL_VERSION {
                    Handshake::Rejected {
                        reason: format!(
                            "incompatible protocol version {protocol_version}, worker speaks {PROTOCOL_VERSION}"
                        ),
                    }
                } else {
                    Handshake::Accepted {
                        protocol_version: PROTOCOL_VERSION,
                    }
                }
            }
            other => Handshake::Rejected {
                reason: format!("expected hello, got {other:?}"),
            },
        }
    }
}

/// A request or response tagged with the call id it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

/// One call on the worker's instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Request {
    OpenDocument(OpenDocument),
    CloseDocument(DocumentRef),
    CloseAllDocuments,
    GetPageCount(DocumentRef),
    GetFileVersion(DocumentRef),
    GetDocPermissions(DocumentRef),
    GetSecurityHandlerRevision(DocumentRef),
    GetPageMode(DocumentRef),
    GetMetadata { document: DocumentRef, tag: String },
    GetTrailerEnds(DocumentRef),
    LoadPage { document: DocumentRef, index: usize },
    ClosePage(PageRef),
    GetPageSize(Page),
    GetPageSizeInPixels { page: Page, dpi: u32 },
    GetPageRotation(Page),
    GetPageTransparency(Page),
    GetPageBoundingBox(Page),
    GetPageText(Page),
    FlattenPage { page: Page, usage: FlattenUsage },
    RenderPageInDpi(RenderPageInDpi),
    RenderPagesInDpi(RenderPagesInDpi),
    RenderPageInPixels(RenderPageInPixels),
    RenderPagesInPixels(RenderPagesInPixels),
    RenderPageWithMatrix(RenderPageWithMatrix),
    RenderToFile(RenderToFile),
    /// Liveness check
    Ping,
    /// Reply, release the library and exit
    Shutdown,
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Unit,
    Document(DocumentRef),
    Page(PageRef),
    Count(usize),
    Int(i32),
    UInt(u32),
    Text(String),
    Offsets(Vec<u32>),
    PageMode(PageMode),
    PageSize(PageSize),
    PageSizeInPixels(PageSizeInPixels),
    Rotation(PageRotation),
    Bool(bool),
    Rect(FsRectF),
    Flatten(FlattenResult),
    Rendered(RenderedPage),
    RenderedPages(RenderedPages),
    File(RenderedFile),
    Pong,
}

/// What the worker sends back for every request
pub type Response = std::result::Result<Reply, PdfiumError>;

//! Error types for pdfium-pool
//!
//! One error enum covers every layer so that a failure raised inside a worker
//! process reaches the host caller unchanged. Variants are grouped by
//! [`ErrorKind`]:
//!
//! - **MemoryIo**: an arena read/write/allocation failed. The allocation
//!   involved is poisoned and the operation aborts.
//! - **Validation**: the caller's request is invalid. Nothing changed.
//! - **Native**: the native library reported an error code.
//! - **PoolTimeout**: no instance became available in time. Retry is fine.
//! - **WorkerCrashed**: the out-of-process instance died or stalled. The
//!   slot is evicted and the call is never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::native::ModuleError;
use crate::types::{DocumentRef, PageRef};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, PdfiumError>;

/// Error codes reported by `FPDF_GetLastError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeErrorCode {
    Unknown,
    File,
    Format,
    Password,
    Security,
    Page,
}

impl NativeErrorCode {
    /// Map a raw `FPDF_ERR_*` value. Returns `None` for `FPDF_ERR_SUCCESS`.
    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            0 => None,
            2 => Some(Self::File),
            3 => Some(Self::Format),
            4 => Some(Self::Password),
            5 => Some(Self::Security),
            6 => Some(Self::Page),
            _ => Some(Self::Unknown),
        }
    }

    pub fn as_raw(&self) -> u32 {
        match self {
            Self::Unknown => 1,
            Self::File => 2,
            Self::Format => 3,
            Self::Password => 4,
            Self::Security => 5,
            Self::Page => 6,
        }
    }
}

impl std::fmt::Display for NativeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Unknown => "unknown error",
            Self::File => "file not found or could not be opened",
            Self::Format => "file not in PDF format or corrupted",
            Self::Password => "password required or incorrect password",
            Self::Security => "unsupported security scheme",
            Self::Page => "page not found or content error",
        };
        f.write_str(text)
    }
}

/// Coarse classification of a [`PdfiumError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MemoryIo,
    Validation,
    Native,
    PoolTimeout,
    Pool,
    WorkerCrashed,
    Transport,
    Io,
}

/// Unified error type
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum PdfiumError {
    // ------------------------------------------------------------------
    // Foreign memory
    // ------------------------------------------------------------------
    #[error("could not allocate {size} bytes of native memory: {reason}")]
    Allocation { size: u64, reason: String },

    #[error("could not read {len} bytes at {pointer:#x} from native memory: {reason}")]
    MemoryRead { pointer: u64, len: u64, reason: String },

    #[error("could not write {len} bytes at {pointer:#x} to native memory: {reason}")]
    MemoryWrite { pointer: u64, len: u64, reason: String },

    #[error("could not encode {layout} into native memory: {reason}")]
    Encode { layout: String, reason: String },

    #[error("could not decode {layout} from native memory: {reason}")]
    Decode { layout: String, reason: String },

    #[error("native call {function} failed: {reason}")]
    NativeCall { function: String, reason: String },

    // ------------------------------------------------------------------
    // Caller input
    // ------------------------------------------------------------------
    #[error("no current document")]
    NoDocument,

    #[error("document {0} is not open in this instance")]
    UnknownDocument(DocumentRef),

    #[error("page {0} is not loaded in this instance")]
    UnknownPage(PageRef),

    #[error("page {index} not found (document has {count} pages)")]
    Page { index: usize, count: usize },

    #[error("no DPI given")]
    NoDpi,

    #[error("no DPI given for requested page {0}")]
    NoDpiForPage(usize),

    #[error("no width or height given")]
    NoWidthOrHeight,

    #[error("no width or height given for requested page {0}")]
    NoWidthOrHeightForPage(usize),

    #[error("no pages given")]
    NoPages,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ------------------------------------------------------------------
    // Native library
    // ------------------------------------------------------------------
    #[error("pdfium: {0}")]
    Native(NativeErrorCode),

    #[error("library has been torn down")]
    LibraryClosed,

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------
    #[error("no instance became available within {0:?}")]
    Timeout(Duration),

    #[error("pool is closed")]
    PoolClosed,

    // ------------------------------------------------------------------
    // Worker transport
    // ------------------------------------------------------------------
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("worker handshake failed: {0}")]
    Handshake(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    // ------------------------------------------------------------------
    // Ambient
    // ------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(String),

    #[error("image error: {0}")]
    Image(String),
}

impl PdfiumError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocation { .. }
            | Self::MemoryRead { .. }
            | Self::MemoryWrite { .. }
            | Self::Encode { .. }
            | Self::Decode { .. }
            | Self::NativeCall { .. } => ErrorKind::MemoryIo,
            Self::NoDocument
            | Self::UnknownDocument(_)
            | Self::UnknownPage(_)
            | Self::Page { .. }
            | Self::NoDpi
            | Self::NoDpiForPage(_)
            | Self::NoWidthOrHeight
            | Self::NoWidthOrHeightForPage(_)
            | Self::NoPages
            | Self::InvalidArgument(_) => ErrorKind::Validation,
            Self::Native(_) | Self::LibraryClosed => ErrorKind::Native,
            Self::Timeout(_) => ErrorKind::PoolTimeout,
            Self::PoolClosed => ErrorKind::Pool,
            Self::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
            Self::Handshake(_) | Self::Protocol(_) => ErrorKind::Transport,
            Self::Io(_) | Self::Image(_) => ErrorKind::Io,
        }
    }

    /// Whether the error invalidated shared state (an allocation or a slot).
    ///
    /// Fatal errors must be propagated, never swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::MemoryIo | ErrorKind::WorkerCrashed)
    }

    pub(crate) fn native_call(function: &str, err: impl std::fmt::Display) -> Self {
        Self::NativeCall {
            function: function.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<ModuleError> for PdfiumError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::OutOfBounds { offset, len, .. } => Self::MemoryRead {
                pointer: offset,
                len,
                reason: err.to_string(),
            },
            other => Self::NativeCall {
                function: other.function().unwrap_or("<module>").to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for PdfiumError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<image::ImageError> for PdfiumError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

impl From<serde_json::Error> for PdfiumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

//! Native call surface
//!
//! PDFium is consumed as an opaque module: a set of exported functions plus
//! one linear memory that every pointer argument refers to. [`NativeModule`]
//! is the only seam to it. Two backends implement it:
//!
//! - [`SimulatedModule`]: an in-memory stand-in with the same export names
//!   and the same 32-bit little-endian ABI. Used by tests and benches, and
//!   by default in the worker binary.
//! - `WasmModule` (feature `wasm`): a real PDFium WebAssembly build run by
//!   wasmtime.
//!
//! The [`Library`] type owns the process-wide init/teardown of one module and
//! is reference counted by the pools built on it.

mod library;
pub mod simulated;
#[cfg(feature = "wasm")]
pub mod wasm;

use thiserror::Error;

pub use library::{Library, LibraryHandle};
pub use simulated::SimulatedModule;
#[cfg(feature = "wasm")]
pub use wasm::WasmModule;

use crate::config::{Backend, BackendConfig};
use crate::error::{PdfiumError, Result};

/// A wasm32 value crossing the native boundary
///
/// Pointers, handles and C `int`s all travel as [`Value::I32`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// Encode a linear memory address
    pub fn pointer(pointer: u64) -> Self {
        Value::I32(pointer as u32 as i32)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret as an unsigned 32-bit value (pointers, `unsigned long`)
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i32().map(|v| v as u32)
    }

    pub fn as_pointer(&self) -> Option<u64> {
        self.as_u32().map(u64::from)
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::F32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }
}

/// Failure raised by a backend
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("memory access out of bounds: {len} bytes at {offset:#x} (memory is {size} bytes)")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("function {0} is not exported")]
    MissingExport(String),

    #[error("{function}: bad arguments: {reason}")]
    BadArguments { function: String, reason: String },

    #[error("{function} trapped: {reason}")]
    Trap { function: String, reason: String },

    #[error("could not load module: {0}")]
    Load(String),
}

impl ModuleError {
    /// Name of the export involved, if any
    pub fn function(&self) -> Option<&str> {
        match self {
            Self::MissingExport(name) => Some(name),
            Self::BadArguments { function, .. } | Self::Trap { function, .. } => Some(function),
            _ => None,
        }
    }

    pub(crate) fn trap(function: &str, reason: impl Into<String>) -> Self {
        Self::Trap {
            function: function.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_arguments(function: &str, reason: impl Into<String>) -> Self {
        Self::BadArguments {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

/// One loaded native module: exported functions plus its linear memory
///
/// Implementations are single threaded. `Send` lets a module move into the
/// thread that owns it; it is never entered from two threads at once.
pub trait NativeModule: Send {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Invoke an exported function
    fn call(&mut self, function: &str, args: &[Value]) -> std::result::Result<Vec<Value>, ModuleError>;

    /// Copy `len` bytes out of linear memory
    fn read_memory(&self, offset: u64, len: u64) -> std::result::Result<Vec<u8>, ModuleError>;

    /// Copy bytes into linear memory
    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> std::result::Result<(), ModuleError>;

    /// Current size of linear memory in bytes
    fn memory_size(&self) -> u64;
}

/// Instantiate the backend selected by configuration
pub fn load_backend(config: &BackendConfig) -> Result<Box<dyn NativeModule>> {
    match config.backend {
        Backend::Simulated => Ok(Box::new(SimulatedModule::with_memory_limit(
            config.memory_limit_bytes(),
        ))),
        Backend::Wasm => load_wasm(config),
    }
}

#[cfg(feature = "wasm")]
fn load_wasm(config: &BackendConfig) -> Result<Box<dyn NativeModule>> {
    let path = config.wasm_path.as_ref().ok_or_else(|| {
        PdfiumError::InvalidArgument("PDFIUM_WASM_PATH is required for the wasm backend".into())
    })?;
    Ok(Box::new(WasmModule::from_file(path, config.memory_limit_bytes())?))
}

#[cfg(not(feature = "wasm"))]
fn load_wasm(_config: &BackendConfig) -> Result<Box<dyn NativeModule>> {
    Err(PdfiumError::InvalidArgument(
        "the wasm backend requires building with the `wasm` feature".into(),
    ))
}

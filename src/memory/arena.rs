//! Foreign memory arena

use std::cell::RefCell;

use tracing::{trace, warn};

use super::pointer::{ArrayPointer, ByteArrayPointer, Scalar, ScalarPointer};
use crate::error::{PdfiumError, Result};
use crate::native::{NativeModule, Value};

/// Raw allocate/free/read/write over one module's linear memory
///
/// The arena owns the module. It is `Send` but not `Sync`: one instance, one
/// thread at a time.
pub struct Arena {
    module: RefCell<Box<dyn NativeModule>>,
}

impl Arena {
    pub fn new(module: Box<dyn NativeModule>) -> Self {
        Self {
            module: RefCell::new(module),
        }
    }

    /// Backend name of the owned module
    pub fn backend(&self) -> String {
        self.module.borrow().name().to_string()
    }

    pub fn memory_size(&self) -> u64 {
        self.module.borrow().memory_size()
    }

    /// Allocate `size` zero-filled bytes
    pub fn malloc(&self, size: u64) -> Result<u64> {
        let size_arg = u32::try_from(size).map_err(|_| PdfiumError::Allocation {
            size,
            reason: "size exceeds the 32-bit address space".into(),
        })?;

        let pointer = self
            .call_one("malloc", &[Value::I32(size_arg as i32)])
            .map_err(|e| PdfiumError::Allocation {
                size,
                reason: e.to_string(),
            })?
            .as_pointer()
            .ok_or_else(|| PdfiumError::Allocation {
                size,
                reason: "malloc returned a non-pointer value".into(),
            })?;

        if pointer == 0 {
            return Err(PdfiumError::Allocation {
                size,
                reason: "native allocator returned null".into(),
            });
        }

        if let Err(e) = self.write(pointer, &vec![0u8; size as usize]) {
            if let Err(free_err) = self.free(pointer) {
                warn!(pointer, error = %free_err, "could not free allocation after failed zero fill");
            }
            return Err(PdfiumError::Allocation {
                size,
                reason: format!("zero fill failed: {e}"),
            });
        }

        trace!(pointer, size, "malloc");
        Ok(pointer)
    }

    /// Return an allocation to the native allocator
    ///
    /// Liveness is not tracked here; freeing twice is the caller's bug.
    pub fn free(&self, pointer: u64) -> Result<()> {
        trace!(pointer, "free");
        self.call("free", &[Value::pointer(pointer)]).map(|_| ())
    }

    pub fn read(&self, pointer: u64, len: u64) -> Result<Vec<u8>> {
        self.module
            .borrow()
            .read_memory(pointer, len)
            .map_err(|e| PdfiumError::MemoryRead {
                pointer,
                len,
                reason: e.to_string(),
            })
    }

    pub fn write(&self, pointer: u64, bytes: &[u8]) -> Result<()> {
        self.module
            .borrow_mut()
            .write_memory(pointer, bytes)
            .map_err(|e| PdfiumError::MemoryWrite {
                pointer,
                len: bytes.len() as u64,
                reason: e.to_string(),
            })
    }

    /// Invoke an export and return all results
    pub fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>> {
        self.module
            .borrow_mut()
            .call(function, args)
            .map_err(|e| PdfiumError::native_call(function, e))
    }

    /// Invoke an export that returns exactly one value
    pub fn call_one(&self, function: &str, args: &[Value]) -> Result<Value> {
        self.call(function, args)?
            .into_iter()
            .next()
            .ok_or_else(|| PdfiumError::native_call(function, "expected a return value"))
    }

    /// Invoke an export returning a C `int` (also used for handles and booleans)
    pub fn call_i32(&self, function: &str, args: &[Value]) -> Result<i32> {
        let value = self.call_one(function, args)?;
        value
            .as_i32()
            .ok_or_else(|| PdfiumError::native_call(function, format!("expected i32, got {value:?}")))
    }

    /// Invoke an export returning a C `float`
    pub fn call_f32(&self, function: &str, args: &[Value]) -> Result<f32> {
        let value = self.call_one(function, args)?;
        value
            .as_f32()
            .ok_or_else(|| PdfiumError::native_call(function, format!("expected f32, got {value:?}")))
    }

    /// Allocate a scalar view
    pub fn scalar<T: Scalar>(&self) -> Result<ScalarPointer<'_, T>> {
        ScalarPointer::new(self)
    }

    /// Allocate a view over `count` consecutive elements
    pub fn array<T: Scalar>(&self, count: usize) -> Result<ArrayPointer<'_, T>> {
        ArrayPointer::new(self, count)
    }

    /// Copy `bytes` into a fresh allocation
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<ByteArrayPointer<'_>> {
        let view = ArrayPointer::new(self, bytes.len())?;
        view.write_all(bytes)?;
        Ok(view)
    }

    /// Copy a NUL-terminated string into a fresh allocation
    pub fn c_string(&self, value: &str) -> Result<ByteArrayPointer<'_>> {
        if value.as_bytes().contains(&0) {
            return Err(PdfiumError::InvalidArgument(
                "string contains an interior NUL byte".into(),
            ));
        }
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }

    /// Take the module back, e.g. to hand it to another instance
    pub fn into_module(self) -> Box<dyn NativeModule> {
        self.module.into_inner()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("backend", &self.backend())
            .field("memory_size", &self.memory_size())
            .finish()
    }
}

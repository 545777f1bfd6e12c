//! Foreign memory marshaling
//!
//! Every argument PDFium reads through a pointer, and every result it writes
//! back, lives in the module's own linear memory. This module moves values
//! across that boundary:
//!
//! - [`Arena`]: allocate, free, read and write raw bytes
//! - typed pointer views ([`IntPointer`], [`UIntArrayPointer`], ...): one
//!   allocation plus a decoder, freed exactly once
//! - struct codec ([`StructPointer`]): fixed-layout geometry structs
//!
//! ```text
//! host                         linear memory
//! ─────────────────────────    ───────────────────────────
//! arena.uint_array(5)    ──▶   malloc(20), zero filled
//! native call            ──▶   writes 5 × u32 LE
//! view.value()           ◀──   read 20 bytes, decode all 5
//! drop(view)             ──▶   free(ptr)
//! ```
//!
//! Views borrow the arena, so none can outlive the instance that owns it, and
//! `release(self)` consumes the view, so use after release does not compile.

mod arena;
mod pointer;
mod structs;

pub use arena::Arena;
pub use pointer::{
    ArrayPointer, ByteArrayPointer, DoublePointer, FloatPointer, IntPointer, LongPointer, Scalar,
    ScalarPointer, UIntArrayPointer, UIntPointer, ULongPointer,
};
pub use structs::{FsMatrix, FsRectF, FsSizeF, NativeStruct, StructPointer};

/// Width of C `int` in the native ABI
pub const C_INT: u64 = 4;
/// Width of C `unsigned int`
pub const C_UINT: u64 = 4;
/// Width of C `float`
pub const C_FLOAT: u64 = 4;
/// Width of C `double`
pub const C_DOUBLE: u64 = 8;
/// Width of the 64-bit `long` used by the native ABI
pub const C_LONG: u64 = 8;
/// Width of the 64-bit `unsigned long`
pub const C_ULONG: u64 = 8;

//! Fixed-layout geometry structs
//!
//! Layouts are part of the contract with the native library:
//!
//! | struct      | fields                      | size |
//! |-------------|-----------------------------|------|
//! | `FS_MATRIX` | a, b, c, d, e, f            | 24   |
//! | `FS_RECTF`  | left, top, right, bottom    | 16   |
//! | `FS_SIZEF`  | width, height               | 8    |
//!
//! Every field is a 4-byte little-endian float at offset `index * 4`.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::pointer::Allocation;
use super::{Arena, C_FLOAT};
use crate::error::{PdfiumError, Result};
use crate::native::Value;

/// A struct made of consecutive C floats
pub trait NativeStruct: Copy + Sized {
    /// C name, for error messages
    const LAYOUT: &'static str;
    /// Field count; the struct is `FIELDS * 4` bytes
    const FIELDS: usize;

    /// Field values in declared order
    fn fields(&self) -> Vec<f32>;

    /// Rebuild from field values in declared order
    fn from_fields(fields: &[f32]) -> Self;

    fn layout_size() -> u64 {
        Self::FIELDS as u64 * C_FLOAT
    }
}

/// `FS_MATRIX`: affine transform from page space to device space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FsMatrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl FsMatrix {
    pub const IDENTITY: FsMatrix = FsMatrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    /// Uniform scale followed by a translation
    pub fn scale_translate(scale: f32, e: f32, f: f32) -> Self {
        Self {
            a: scale,
            d: scale,
            e,
            f,
            ..Self::IDENTITY
        }
    }
}

impl NativeStruct for FsMatrix {
    const LAYOUT: &'static str = "FS_MATRIX";
    const FIELDS: usize = 6;

    fn fields(&self) -> Vec<f32> {
        vec![self.a, self.b, self.c, self.d, self.e, self.f]
    }

    fn from_fields(v: &[f32]) -> Self {
        Self {
            a: v[0],
            b: v[1],
            c: v[2],
            d: v[3],
            e: v[4],
            f: v[5],
        }
    }
}

/// `FS_RECTF`: a rectangle; in page space `top` is above `bottom`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FsRectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NativeStruct for FsRectF {
    const LAYOUT: &'static str = "FS_RECTF";
    const FIELDS: usize = 4;

    fn fields(&self) -> Vec<f32> {
        vec![self.left, self.top, self.right, self.bottom]
    }

    fn from_fields(v: &[f32]) -> Self {
        Self {
            left: v[0],
            top: v[1],
            right: v[2],
            bottom: v[3],
        }
    }
}

/// `FS_SIZEF`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FsSizeF {
    pub width: f32,
    pub height: f32,
}

impl NativeStruct for FsSizeF {
    const LAYOUT: &'static str = "FS_SIZEF";
    const FIELDS: usize = 2;

    fn fields(&self) -> Vec<f32> {
        vec![self.width, self.height]
    }

    fn from_fields(v: &[f32]) -> Self {
        Self {
            width: v[0],
            height: v[1],
        }
    }
}

/// An encoded struct living in linear memory
pub struct StructPointer<'a, S: NativeStruct> {
    allocation: Allocation<'a>,
    _marker: PhantomData<S>,
}

impl<'a, S: NativeStruct> StructPointer<'a, S> {
    pub fn pointer(&self) -> u64 {
        self.allocation.pointer()
    }

    pub fn arg(&self) -> Value {
        Value::pointer(self.pointer())
    }

    /// Read every field back from its fixed offset
    pub fn decode(&self) -> Result<S> {
        let mut fields = Vec::with_capacity(S::FIELDS);
        for index in 0..S::FIELDS {
            let bytes = self
                .allocation
                .read_at(index as u64 * C_FLOAT, C_FLOAT)
                .map_err(|e| PdfiumError::Decode {
                    layout: S::LAYOUT.to_string(),
                    reason: format!("field {index}: {e}"),
                })?;
            let value = bytes
                .try_into()
                .map(f32::from_le_bytes)
                .map_err(|_| PdfiumError::Decode {
                    layout: S::LAYOUT.to_string(),
                    reason: format!("field {index} is not {C_FLOAT} bytes"),
                })?;
            fields.push(value);
        }
        Ok(S::from_fields(&fields))
    }

    pub fn release(self) -> Result<()> {
        self.allocation.release()
    }
}

impl Arena {
    /// Allocate a struct, optionally writing `input` into it
    ///
    /// On a failed field write the allocation is freed before returning.
    pub fn encode<S: NativeStruct>(&self, input: Option<&S>) -> Result<StructPointer<'_, S>> {
        let allocation = Allocation::new(self, S::layout_size())?;

        if let Some(input) = input {
            for (index, field) in input.fields().into_iter().enumerate() {
                let written = allocation.write_at(index as u64 * C_FLOAT, &field.to_le_bytes());
                if let Err(e) = written {
                    if let Err(free_err) = allocation.release() {
                        warn!(layout = S::LAYOUT, error = %free_err, "could not free struct after failed encode");
                    }
                    return Err(PdfiumError::Encode {
                        layout: S::LAYOUT.to_string(),
                        reason: format!("field {index}: {e}"),
                    });
                }
            }
        }

        Ok(StructPointer {
            allocation,
            _marker: PhantomData,
        })
    }
}

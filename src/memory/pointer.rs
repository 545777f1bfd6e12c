//! Typed pointer views
//!
//! A view owns one allocation in linear memory and knows how to decode it.
//! Views are move-only: `release(self)` frees the allocation and consumes the
//! view, and dropping an unreleased view frees it as well, so every
//! allocation is freed exactly once.

use std::marker::PhantomData;

use tracing::warn;

use super::{Arena, C_DOUBLE, C_FLOAT, C_INT, C_LONG, C_UINT, C_ULONG};
use crate::error::{PdfiumError, Result};
use crate::native::Value;

/// A fixed-width little-endian value of the native ABI
pub trait Scalar: Copy + Send + 'static {
    /// Width in bytes inside linear memory
    const WIDTH: u64;
    /// C type name, for error messages
    const C_NAME: &'static str;

    fn decode(bytes: &[u8]) -> Option<Self>;
    fn encode(self) -> Vec<u8>;
}

macro_rules! scalar {
    ($ty:ty, $width:expr, $name:literal) => {
        impl Scalar for $ty {
            const WIDTH: u64 = $width;
            const C_NAME: &'static str = $name;

            fn decode(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(<$ty>::from_le_bytes)
            }

            fn encode(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    };
}

scalar!(i32, C_INT, "int");
scalar!(u32, C_UINT, "unsigned int");
scalar!(f32, C_FLOAT, "float");
scalar!(f64, C_DOUBLE, "double");
scalar!(i64, C_LONG, "long");
scalar!(u64, C_ULONG, "unsigned long");
scalar!(u8, 1, "unsigned char");

/// One live allocation, freed on release or drop
pub(crate) struct Allocation<'a> {
    arena: &'a Arena,
    pointer: u64,
    size: u64,
    live: bool,
}

impl<'a> Allocation<'a> {
    pub(crate) fn new(arena: &'a Arena, size: u64) -> Result<Self> {
        let pointer = arena.malloc(size)?;
        Ok(Self {
            arena,
            pointer,
            size,
            live: true,
        })
    }

    pub(crate) fn pointer(&self) -> u64 {
        self.pointer
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.bounds(offset, len)?;
        self.arena.read(self.pointer + offset, len)
    }

    pub(crate) fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.bounds(offset, bytes.len() as u64)?;
        self.arena.write(self.pointer + offset, bytes)
    }

    fn bounds(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PdfiumError::MemoryRead {
                pointer: self.pointer + offset,
                len,
                reason: format!("outside the {} byte allocation", self.size),
            }),
        }
    }

    pub(crate) fn release(mut self) -> Result<()> {
        self.live = false;
        self.arena.free(self.pointer)
    }

    /// Give up ownership without freeing
    pub(crate) fn into_raw(mut self) -> u64 {
        self.live = false;
        self.pointer
    }
}

impl Drop for Allocation<'_> {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.arena.free(self.pointer) {
                warn!(pointer = self.pointer, error = %e, "failed to free native allocation");
            }
        }
    }
}

/// View over a single scalar
pub struct ScalarPointer<'a, T: Scalar> {
    allocation: Allocation<'a>,
    _marker: PhantomData<T>,
}

pub type IntPointer<'a> = ScalarPointer<'a, i32>;
pub type UIntPointer<'a> = ScalarPointer<'a, u32>;
pub type FloatPointer<'a> = ScalarPointer<'a, f32>;
pub type DoublePointer<'a> = ScalarPointer<'a, f64>;
pub type LongPointer<'a> = ScalarPointer<'a, i64>;
pub type ULongPointer<'a> = ScalarPointer<'a, u64>;

impl<'a, T: Scalar> ScalarPointer<'a, T> {
    pub(crate) fn new(arena: &'a Arena) -> Result<Self> {
        Ok(Self {
            allocation: Allocation::new(arena, T::WIDTH)?,
            _marker: PhantomData,
        })
    }

    pub fn pointer(&self) -> u64 {
        self.allocation.pointer()
    }

    /// The pointer as a call argument
    pub fn arg(&self) -> Value {
        Value::pointer(self.pointer())
    }

    /// Decode the current value
    pub fn value(&self) -> Result<T> {
        let bytes = self.allocation.read_at(0, T::WIDTH)?;
        T::decode(&bytes).ok_or_else(|| PdfiumError::Decode {
            layout: T::C_NAME.to_string(),
            reason: format!("expected {} bytes, got {}", T::WIDTH, bytes.len()),
        })
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.allocation.write_at(0, &value.encode())
    }

    pub fn release(self) -> Result<()> {
        self.allocation.release()
    }
}

/// View over `count` consecutive scalars
pub struct ArrayPointer<'a, T: Scalar> {
    allocation: Allocation<'a>,
    count: usize,
    _marker: PhantomData<T>,
}

pub type UIntArrayPointer<'a> = ArrayPointer<'a, u32>;
pub type ByteArrayPointer<'a> = ArrayPointer<'a, u8>;

impl<'a, T: Scalar> ArrayPointer<'a, T> {
    pub(crate) fn new(arena: &'a Arena, count: usize) -> Result<Self> {
        let size = (count as u64).checked_mul(T::WIDTH).ok_or_else(|| PdfiumError::Allocation {
            size: u64::MAX,
            reason: format!("{count} × {} overflows", T::C_NAME),
        })?;
        Ok(Self {
            allocation: Allocation::new(arena, size)?,
            count,
            _marker: PhantomData,
        })
    }

    pub fn pointer(&self) -> u64 {
        self.allocation.pointer()
    }

    pub fn arg(&self) -> Value {
        Value::pointer(self.pointer())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the allocation in bytes
    pub fn byte_len(&self) -> u64 {
        self.allocation.size()
    }

    /// Decode every element, in index order
    pub fn value(&self) -> Result<Vec<T>> {
        let bytes = self.allocation.read_at(0, self.allocation.size())?;
        let mut values = Vec::with_capacity(self.count);
        for (index, chunk) in bytes.chunks_exact(T::WIDTH as usize).enumerate() {
            let value = T::decode(chunk).ok_or_else(|| PdfiumError::Decode {
                layout: format!("{}[{}]", T::C_NAME, self.count),
                reason: format!("element {index} is malformed"),
            })?;
            values.push(value);
        }
        if values.len() != self.count {
            return Err(PdfiumError::Decode {
                layout: format!("{}[{}]", T::C_NAME, self.count),
                reason: format!("decoded {} elements", values.len()),
            });
        }
        Ok(values)
    }

    /// Decode one element
    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.count {
            return Err(PdfiumError::InvalidArgument(format!(
                "index {index} out of range for {} elements",
                self.count
            )));
        }
        let bytes = self.allocation.read_at(index as u64 * T::WIDTH, T::WIDTH)?;
        T::decode(&bytes).ok_or_else(|| PdfiumError::Decode {
            layout: T::C_NAME.to_string(),
            reason: format!("element {index} is malformed"),
        })
    }

    /// Overwrite the leading elements with `values`
    pub fn write_all(&self, values: &[T]) -> Result<()> {
        if values.len() > self.count {
            return Err(PdfiumError::InvalidArgument(format!(
                "{} values do not fit in {} elements",
                values.len(),
                self.count
            )));
        }
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.encode()).collect();
        self.allocation.write_at(0, &bytes)
    }

    pub fn release(self) -> Result<()> {
        self.allocation.release()
    }

    /// Hand ownership of the allocation to the caller, who must free it
    pub fn into_raw(self) -> u64 {
        self.allocation.into_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::SimulatedModule;

    fn arena() -> Arena {
        Arena::new(Box::new(SimulatedModule::new()))
    }

    #[test]
    fn test_uint_array_decodes_every_element() {
        let arena = arena();
        let view = arena.array::<u32>(5).unwrap();
        let raw: Vec<u8> = [1u32, 2, 3, 4, 5].iter().flat_map(|v| v.to_le_bytes()).collect();
        arena.write(view.pointer(), &raw).unwrap();

        assert_eq!(view.value().unwrap(), vec![1, 2, 3, 4, 5]);
        // decoding is repeatable until release
        assert_eq!(view.value().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(view.get(3).unwrap(), 4);
        view.release().unwrap();
    }

    #[test]
    fn test_scalar_widths() {
        let arena = arena();
        let int = arena.scalar::<i32>().unwrap();
        let double = arena.scalar::<f64>().unwrap();
        let long = arena.scalar::<i64>().unwrap();
        assert_eq!(double.pointer() - int.pointer(), 8);
        assert_eq!(long.pointer() - double.pointer(), 8);

        int.set(-7).unwrap();
        double.set(2.5).unwrap();
        long.set(-1).unwrap();
        assert_eq!(int.value().unwrap(), -7);
        assert_eq!(double.value().unwrap(), 2.5);
        assert_eq!(arena.read(long.pointer(), 8).unwrap(), vec![0xFF; 8]);
    }

    #[test]
    fn test_fresh_views_read_zero() {
        let arena = arena();
        assert_eq!(arena.scalar::<u64>().unwrap().value().unwrap(), 0);
        assert_eq!(arena.array::<u8>(4).unwrap().value().unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_drop_frees_allocation() {
        let arena = arena();
        let pointer = {
            let view = arena.scalar::<u32>().unwrap();
            view.pointer()
        };
        // the slot is free again
        assert_eq!(arena.malloc(4).unwrap(), pointer);
    }

    #[test]
    fn test_release_then_drop_frees_once() {
        let arena = arena();
        let view = arena.array::<u32>(2).unwrap();
        let pointer = view.pointer();
        view.release().unwrap();
        // a second free of the same pointer would trap in the module
        assert!(arena.free(pointer).is_err());
    }

    #[test]
    fn test_into_raw_keeps_allocation() {
        let arena = arena();
        let pointer = arena.alloc_bytes(b"pdf").unwrap().into_raw();
        assert_eq!(arena.read(pointer, 3).unwrap(), b"pdf".to_vec());
        arena.free(pointer).unwrap();
    }

    #[test]
    fn test_write_all_rejects_overflow() {
        let arena = arena();
        let view = arena.array::<u32>(2).unwrap();
        assert!(view.write_all(&[1, 2, 3]).is_err());
        assert!(view.get(2).is_err());
    }

    #[test]
    fn test_empty_array() {
        let arena = arena();
        let view = arena.array::<u32>(0).unwrap();
        assert!(view.is_empty());
        assert_eq!(view.value().unwrap(), Vec::<u32>::new());
    }
}

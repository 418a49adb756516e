//! The common tensor-reader contract (spec.md §4.7): every format parser
//! exposes the same buffer-iteration surface and also *is* a `Storage`
//! over whichever buffer is currently open, delegating through a
//! `RegionStorage` the way spec.md §9 suggests ("each tensor reader
//! records `(region_offset, region_size)` and clamps directly").
//!
//! Grounded on the teacher's habit of factoring shared bookkeeping into
//! one small type (`PickleStack`/`PickleMemo` in `eval.rs`) rather than
//! duplicating it per caller — here `read_all_tensor_infos` is one
//! default method shared by all three format readers instead of being
//! hand-duplicated per format (SPEC_FULL.md §4).

use crate::error::{StorageError, TensorReaderError};
use crate::storage::{ReadBuf, ReadFlags, Storage};

/// Sentinel `offset_start` used by `TensorInfo` values that cross
/// buffers and therefore have no single meaningful offset.
pub const OFFSET_UNKNOWN: u64 = u64::MAX;

/// Closed tag for tensor element representation (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Unknown,
    F32,
    F64,
    F16,
    Bf16,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F8E5M2,
    F8E4M3,
    Bool,
    ComplexF32,
    ComplexF64,
    ComplexF16,
}

impl ValueType {
    /// Fixed element size in bytes; `Unknown` is 0 and signals an
    /// unsupported or quantised type.
    pub fn element_size(self) -> u64 {
        match self {
            ValueType::Unknown => 0,
            ValueType::F32 => 4,
            ValueType::F64 => 8,
            ValueType::F16 => 2,
            ValueType::Bf16 => 2,
            ValueType::U8 => 1,
            ValueType::U16 => 2,
            ValueType::U32 => 4,
            ValueType::U64 => 8,
            ValueType::I8 => 1,
            ValueType::I16 => 2,
            ValueType::I32 => 4,
            ValueType::I64 => 8,
            ValueType::F8E5M2 => 1,
            ValueType::F8E4M3 => 1,
            ValueType::Bool => 1,
            ValueType::ComplexF32 => 8,
            ValueType::ComplexF64 => 16,
            ValueType::ComplexF16 => 4,
        }
    }
}

/// Pure metadata for one tensor, no payload (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub offset_start: u64,
    pub size_bytes: u64,
    pub value_type: ValueType,
    pub shape: Vec<u64>,
    pub stride: Vec<u64>,
}

impl TensorInfo {
    /// `size_bytes` for a canonical row-major layout: `element_size *
    /// product(shape)`.
    pub fn row_major_size(value_type: ValueType, shape: &[u64]) -> Option<u64> {
        let elems = shape.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))?;
        elems.checked_mul(value_type.element_size())
    }

    /// `size_bytes` for a strided view: `element_size * (1 + sum_i
    /// (shape[i]-1) * stride[i])`.
    pub fn strided_size(value_type: ValueType, shape: &[u64], stride: &[u64]) -> Option<u64> {
        let mut span: u64 = 1;
        for (&extent, &step) in shape.iter().zip(stride) {
            let extent_minus_one = extent.checked_sub(1)?;
            span = span.checked_add(extent_minus_one.checked_mul(step)?)?;
        }
        span.checked_mul(value_type.element_size())
    }

    /// Row-major stride for a given `shape`, innermost dimension last.
    pub fn row_major_stride(shape: &[u64]) -> Vec<u64> {
        let mut stride = vec![1u64; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * shape[i + 1];
        }
        stride
    }
}

/// The unit of iteration surfaced by a `TensorReader`: a contiguous
/// byte range accompanied by the tensors that lie entirely within it.
#[derive(Debug, Clone)]
pub struct BufferView {
    pub size: u64,
    pub tensors: Vec<TensorInfo>,
}

/// Shared contract for Safetensors, GGUF, PyTorch, and the buffer
/// splitter. A reader also behaves as a `Storage` over whichever buffer
/// is currently open.
pub trait TensorReader: Storage {
    fn read_next_buffer(&mut self) -> Result<bool, TensorReaderError>;

    /// Offsets are buffer-relative.
    fn tensors_in_buffer(&self) -> &[TensorInfo];

    fn buffer_size(&self) -> u64;

    /// The full, precomputed tensor list with real per-buffer offsets
    /// (formats parse all metadata up front), used by the default
    /// `read_all_tensor_infos` implementation.
    fn all_infos(&self) -> &[TensorInfo];

    /// Offsets are set to `OFFSET_UNKNOWN` because entries here may
    /// come from different buffers.
    fn read_all_tensor_infos(&self) -> Vec<TensorInfo> {
        self.all_infos()
            .iter()
            .cloned()
            .map(|mut info| {
                info.offset_start = OFFSET_UNKNOWN;
                info
            })
            .collect()
    }

    fn current_buffer_view(&self) -> BufferView {
        BufferView {
            size: self.buffer_size(),
            tensors: self.tensors_in_buffer().to_vec(),
        }
    }
}

impl Storage for Box<dyn TensorReader> {
    fn current_position(&self) -> u64 {
        (**self).current_position()
    }
    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        (**self).read(length, flags)
    }
    fn can_seek_back(&self, allow_detect: bool) -> bool {
        (**self).can_seek_back(allow_detect)
    }
    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        (**self).seek_to(absolute)
    }
    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        (**self).seek_from_back(absolute_from_end)
    }
    fn len_hint(&self) -> Option<u64> {
        (**self).len_hint()
    }
}

impl TensorReader for Box<dyn TensorReader> {
    fn read_next_buffer(&mut self) -> Result<bool, TensorReaderError> {
        (**self).read_next_buffer()
    }
    fn tensors_in_buffer(&self) -> &[TensorInfo] {
        (**self).tensors_in_buffer()
    }
    fn buffer_size(&self) -> u64 {
        (**self).buffer_size()
    }
    fn all_infos(&self) -> &[TensorInfo] {
        (**self).all_infos()
    }
}

/// Delegates the `Storage` contract to a `RegionStorage`, the shape
/// every concrete format reader in `tensor::*` uses for its currently
/// open buffer.
pub(crate) fn region_read<'a>(
    region: Option<&'a crate::storage::region::RegionStorage>,
    length: u64,
    flags: ReadFlags,
) -> Result<ReadBuf<'a>, StorageError> {
    match region {
        Some(r) => r.read(length, flags),
        None => {
            if flags.contains(ReadFlags::ALLOW_EMPTY) {
                Ok(ReadBuf::Owned(Vec::new()))
            } else {
                Err(StorageError::EndOfStream {
                    requested: length,
                    available: 0,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_stride_matches_spec_example() {
        assert_eq!(
            TensorInfo::row_major_stride(&[2, 3, 2, 2]),
            vec![12, 4, 2, 1]
        );
    }

    #[test]
    fn rank_zero_stride_is_empty() {
        assert_eq!(TensorInfo::row_major_stride(&[]), Vec::<u64>::new());
    }

    #[test]
    fn strided_size_matches_row_major_when_stride_is_row_major() {
        let shape = vec![2, 3];
        let stride = TensorInfo::row_major_stride(&shape);
        assert_eq!(
            TensorInfo::strided_size(ValueType::F32, &shape, &stride),
            TensorInfo::row_major_size(ValueType::F32, &shape)
        );
    }
}

//! GGUF container reader (spec.md §4.5): `"GGUF"` magic, a version field
//! this crate requires to be `3`, a metadata key/value section with a
//! small typed-tag value model (including nested arrays), and a tensor
//! info table whose per-tensor extents are stored fastest-dimension-first
//! (the reverse of this crate's row-major `shape` convention) ahead of a
//! single alignment-padded data section.
//!
//! Grounded on the same byte-at-a-time `Storage` reading style as
//! `pickle::parse` (`util::le_*` plus small local helpers) rather than a
//! `nom` parser, since GGUF's variable-length strings and arrays are just
//! as naturally a sequential read.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{StorageError, TensorReaderError};
use crate::storage::region::RegionStorage;
use crate::storage::{ReadBuf, ReadFlags, SharedStorage, Storage};
use crate::tensor::reader::{region_read, TensorInfo, TensorReader, ValueType};
use crate::util::{le_f32, le_f64, le_u16, le_u32, le_u64};

const MAGIC: &[u8; 4] = b"GGUF";
const SUPPORTED_VERSION: u32 = 3;
const DEFAULT_ALIGNMENT: u64 = 32;

/// One metadata value, tagged the way GGUF itself tags them.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
}

impl GgufValue {
    fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufValue::U8(v) => Some(v as u64),
            GgufValue::U16(v) => Some(v as u64),
            GgufValue::U32(v) => Some(v as u64),
            GgufValue::U64(v) => Some(v),
            GgufValue::I8(v) if v >= 0 => Some(v as u64),
            GgufValue::I16(v) if v >= 0 => Some(v as u64),
            GgufValue::I32(v) if v >= 0 => Some(v as u64),
            GgufValue::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }
}

fn read_exact(storage: &dyn Storage, len: u64) -> Result<Vec<u8>, StorageError> {
    Ok(storage.read(len, ReadFlags::NONE)?.into_owned())
}

fn read_u8(storage: &dyn Storage) -> Result<u8, StorageError> {
    Ok(read_exact(storage, 1)?[0])
}

fn read_u16(storage: &dyn Storage) -> Result<u16, StorageError> {
    le_u16(&read_exact(storage, 2)?)
}

fn read_u32(storage: &dyn Storage) -> Result<u32, StorageError> {
    le_u32(&read_exact(storage, 4)?)
}

fn read_u64(storage: &dyn Storage) -> Result<u64, StorageError> {
    le_u64(&read_exact(storage, 8)?)
}

fn read_f32(storage: &dyn Storage) -> Result<f32, StorageError> {
    le_f32(&read_exact(storage, 4)?)
}

fn read_f64(storage: &dyn Storage) -> Result<f64, StorageError> {
    le_f64(&read_exact(storage, 8)?)
}

/// GGUF strings are a `u64` byte length followed by (not necessarily
/// NUL-terminated) UTF-8 bytes.
fn read_gguf_string(storage: &dyn Storage) -> Result<String, TensorReaderError> {
    let len = read_u64(storage)?;
    let bytes = read_exact(storage, len)?;
    String::from_utf8(bytes).map_err(|e| {
        TensorReaderError::UnexpectedPickleShape(format!("gguf string is not valid utf-8: {e}"))
    })
}

/// Metadata value type tags, per the GGUF specification.
const TAG_U8: u32 = 0;
const TAG_I8: u32 = 1;
const TAG_U16: u32 = 2;
const TAG_I16: u32 = 3;
const TAG_U32: u32 = 4;
const TAG_I32: u32 = 5;
const TAG_F32: u32 = 6;
const TAG_BOOL: u32 = 7;
const TAG_STRING: u32 = 8;
const TAG_ARRAY: u32 = 9;
const TAG_U64: u32 = 10;
const TAG_I64: u32 = 11;
const TAG_F64: u32 = 12;

fn read_value(storage: &dyn Storage, tag: u32) -> Result<GgufValue, TensorReaderError> {
    Ok(match tag {
        TAG_U8 => GgufValue::U8(read_u8(storage)?),
        TAG_I8 => GgufValue::I8(read_u8(storage)? as i8),
        TAG_U16 => GgufValue::U16(read_u16(storage)?),
        TAG_I16 => GgufValue::I16(read_u16(storage)? as i16),
        TAG_U32 => GgufValue::U32(read_u32(storage)?),
        TAG_I32 => GgufValue::I32(read_u32(storage)? as i32),
        TAG_F32 => GgufValue::F32(read_f32(storage)?),
        TAG_BOOL => GgufValue::Bool(read_u8(storage)? != 0),
        TAG_STRING => GgufValue::String(read_gguf_string(storage)?),
        TAG_U64 => GgufValue::U64(read_u64(storage)?),
        TAG_I64 => GgufValue::I64(read_u64(storage)? as i64),
        TAG_F64 => GgufValue::F64(read_f64(storage)?),
        TAG_ARRAY => {
            let element_tag = read_u32(storage)?;
            let count = read_u64(storage)?;
            let mut items = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                items.push(read_value(storage, element_tag)?);
            }
            GgufValue::Array(items)
        }
        other => {
            return Err(TensorReaderError::UnexpectedPickleShape(format!(
                "unknown gguf metadata value tag {other}"
            )))
        }
    })
}

struct RawTensorInfo {
    name: String,
    shape: Vec<u64>,
    ggml_type: u32,
    relative_offset: u64,
}

/// Reads the GGUF format: a single data buffer holding every tensor,
/// back to back and alignment-padded, following the metadata and
/// tensor-info sections.
pub struct GgufReader {
    backing: SharedStorage,
    data_offset: u64,
    data_size: u64,
    infos: Vec<TensorInfo>,
    metadata: BTreeMap<String, GgufValue>,
    opened: bool,
    region: Option<RegionStorage>,
}

impl GgufReader {
    pub fn open(backing: SharedStorage) -> Result<Self, TensorReaderError> {
        let magic = read_exact(backing.as_ref(), 4)?;
        if magic.as_slice() != MAGIC {
            return Err(TensorReaderError::UnknownFormat);
        }
        let version = read_u32(backing.as_ref())?;
        if version != SUPPORTED_VERSION {
            return Err(TensorReaderError::UnsupportedVersion(version as u64));
        }
        let tensor_count = read_u64(backing.as_ref())?;
        let metadata_kv_count = read_u64(backing.as_ref())?;

        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_kv_count {
            let key = read_gguf_string(backing.as_ref())?;
            let tag = read_u32(backing.as_ref())?;
            let value = read_value(backing.as_ref(), tag)?;
            metadata.insert(key, value);
        }

        let alignment = match metadata.get("general.alignment") {
            Some(v) => v.as_u64().ok_or_else(|| {
                TensorReaderError::UnexpectedPickleShape(
                    "general.alignment is not an unsigned integer".to_string(),
                )
            })?,
            None => DEFAULT_ALIGNMENT,
        };
        if alignment == 0 || alignment % 8 != 0 {
            return Err(TensorReaderError::UnsupportedAlignment(alignment));
        }

        let mut raw_infos = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            let name = read_gguf_string(backing.as_ref())?;
            let n_dims = read_u32(backing.as_ref())?;
            let mut extents = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                extents.push(read_u64(backing.as_ref())?);
            }
            // GGUF stores extents fastest-varying-first; reverse for
            // this crate's row-major `shape` convention.
            extents.reverse();
            let ggml_type = read_u32(backing.as_ref())?;
            let relative_offset = read_u64(backing.as_ref())?;
            raw_infos.push(RawTensorInfo {
                name,
                shape: extents,
                ggml_type,
                relative_offset,
            });
        }

        let header_end = backing.current_position();
        let data_offset = round_up(header_end, alignment);

        let file_len = backing.len_hint();
        let mut infos = Vec::with_capacity(raw_infos.len());
        for raw in &raw_infos {
            let value_type = value_type_from_ggml_type(raw.ggml_type);
            // Unquantised types get their exact row-major size; quantised
            // and otherwise-unrepresentable types get 0, per the "unknown
            // type implies size_bytes == 0" rule — never the gap to the
            // next tensor, which would fold alignment padding in.
            let size_bytes = TensorInfo::row_major_size(value_type, &raw.shape)
                .ok_or(TensorReaderError::Overflow)?;
            let stride = TensorInfo::row_major_stride(&raw.shape);
            infos.push(TensorInfo {
                name: raw.name.clone(),
                offset_start: raw.relative_offset,
                size_bytes,
                value_type,
                shape: raw.shape.clone(),
                stride,
            });
        }

        // The buffer itself still spans the full data section, including
        // alignment padding and any quantised tensors' real on-disk bytes,
        // independent of each tensor's computed `size_bytes`.
        let data_size = match file_len {
            Some(len) => len.saturating_sub(data_offset),
            None => infos
                .iter()
                .map(|t| t.offset_start + t.size_bytes)
                .max()
                .unwrap_or(0),
        };

        Ok(Self {
            backing,
            data_offset,
            data_size,
            infos,
            metadata,
            opened: false,
            region: None,
        })
    }

    pub fn metadata(&self) -> &BTreeMap<String, GgufValue> {
        &self.metadata
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    let remainder = value % alignment;
    if remainder == 0 {
        value
    } else {
        value + (alignment - remainder)
    }
}

/// Only the unquantised element types this crate models with a fixed
/// element size map to a concrete `ValueType`; block-quantised ggml types
/// (`Q4_0`, `Q8_0`, the `_K` family, ...) map to `Unknown` since their
/// byte layout isn't `element_size * product(shape)`.
fn value_type_from_ggml_type(ggml_type: u32) -> ValueType {
    match ggml_type {
        0 => ValueType::F32,
        1 => ValueType::F16,
        24 => ValueType::I8,
        25 => ValueType::I16,
        26 => ValueType::I32,
        27 => ValueType::I64,
        28 => ValueType::F64,
        30 => ValueType::Bf16,
        _ => ValueType::Unknown,
    }
}

impl Storage for GgufReader {
    fn current_position(&self) -> u64 {
        self.region.as_ref().map(Storage::current_position).unwrap_or(0)
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        region_read(self.region.as_ref(), length, flags)
    }

    fn can_seek_back(&self, allow_detect: bool) -> bool {
        self.region.as_ref().map(|r| r.can_seek_back(allow_detect)).unwrap_or(false)
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        match &self.region {
            Some(r) => r.seek_to(absolute),
            None => Err(StorageError::SeekFailed("no buffer is open".to_string())),
        }
    }

    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        match &self.region {
            Some(r) => r.seek_from_back(absolute_from_end),
            None => Err(StorageError::SeekFailed("no buffer is open".to_string())),
        }
    }

    fn len_hint(&self) -> Option<u64> {
        self.region.as_ref().and_then(Storage::len_hint)
    }
}

impl TensorReader for GgufReader {
    fn read_next_buffer(&mut self) -> Result<bool, TensorReaderError> {
        if self.opened {
            self.region = None;
            return Ok(false);
        }
        self.opened = true;
        self.region = Some(RegionStorage::new(
            Rc::clone(&self.backing),
            self.data_offset,
            self.data_size,
        ));
        Ok(true)
    }

    fn tensors_in_buffer(&self) -> &[TensorInfo] {
        if self.opened && self.region.is_some() {
            &self.infos
        } else {
            &[]
        }
    }

    fn buffer_size(&self) -> u64 {
        self.data_size
    }

    fn all_infos(&self) -> &[TensorInfo] {
        &self.infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn le_string(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn build_minimal_gguf(alignment: u64, shapes: &[(&str, Vec<u64>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&(shapes.len() as u64).to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes()); // one metadata kv

        out.extend_from_slice(&le_string("general.alignment"));
        out.extend_from_slice(&TAG_U32.to_le_bytes());
        out.extend_from_slice(&(alignment as u32).to_le_bytes());

        let mut relative_offset = 0u64;
        for (name, shape) in shapes {
            out.extend_from_slice(&le_string(name));
            out.extend_from_slice(&(shape.len() as u32).to_le_bytes());
            // GGUF stores extents fastest-varying-first.
            for dim in shape.iter().rev() {
                out.extend_from_slice(&dim.to_le_bytes());
            }
            out.extend_from_slice(&0u32.to_le_bytes()); // F32
            out.extend_from_slice(&relative_offset.to_le_bytes());
            let elems: u64 = shape.iter().product();
            relative_offset += elems * 4;
        }
        let pre_pad_len = out.len() as u64;
        let data_offset = round_up(pre_pad_len, alignment);
        out.resize(data_offset as usize, 0);
        out.resize((data_offset + relative_offset) as usize, 0);
        out
    }

    #[test]
    fn rejects_bad_magic() {
        let backing: SharedStorage = Rc::new(MemoryStorage::new(vec![0u8; 16]));
        assert!(matches!(GgufReader::open(backing), Err(TensorReaderError::UnknownFormat)));
    }

    #[test]
    fn parses_alignment_96_and_multiple_ranks() {
        let bytes = build_minimal_gguf(
            96,
            &[
                ("scalar", vec![]),
                ("vec", vec![4]),
                ("mat", vec![2, 3]),
                ("cube", vec![2, 3, 2]),
                ("hyper", vec![2, 3, 2, 2]),
            ],
        );
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        let mut reader = GgufReader::open(backing).unwrap();
        assert_eq!(reader.data_offset % 96, 0);
        assert!(reader.read_next_buffer().unwrap());
        let infos = reader.tensors_in_buffer();
        assert_eq!(infos.len(), 5);
        let hyper = infos.iter().find(|t| t.name == "hyper").unwrap();
        assert_eq!(hyper.shape, vec![2, 3, 2, 2]);
        assert_eq!(hyper.stride, vec![12, 4, 2, 1]);
    }

    #[test]
    fn rejects_alignment_not_a_multiple_of_eight() {
        let bytes = build_minimal_gguf(12, &[("a", vec![1])]);
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        assert!(matches!(
            GgufReader::open(backing),
            Err(TensorReaderError::UnsupportedAlignment(12))
        ));
    }
}

//! Safetensors container reader (spec.md §4.4): an 8-byte little-endian
//! header length, a JSON tensor table, and a single contiguous data
//! buffer immediately following the header. Grounded on the teacher's
//! preference for `serde`/`serde_json` elsewhere in the pack
//! (`other_examples/`) for exactly this kind of self-describing header,
//! and on this crate's own `Storage`/`RegionStorage` pair for the data
//! buffer itself.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;

use crate::error::{StorageError, TensorReaderError};
use crate::storage::region::RegionStorage;
use crate::storage::{ReadBuf, ReadFlags, SharedStorage, Storage};
use crate::tensor::reader::{region_read, TensorInfo, TensorReader, ValueType};
use crate::util::le_u64;

#[derive(Debug, Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

/// Reads the single-buffer Safetensors format.
pub struct SafetensorsReader {
    backing: SharedStorage,
    data_offset: u64,
    data_size: u64,
    infos: Vec<TensorInfo>,
    metadata: BTreeMap<String, String>,
    opened: bool,
    region: Option<RegionStorage>,
}

impl SafetensorsReader {
    pub fn open(backing: SharedStorage) -> Result<Self, TensorReaderError> {
        let header_len_bytes = backing.read(8, ReadFlags::NONE)?.into_owned();
        let header_len = le_u64(&header_len_bytes)?;
        let header_bytes = backing.read(header_len, ReadFlags::NONE)?.into_owned();
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&header_bytes)?;

        let mut metadata = BTreeMap::new();
        let mut infos = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            if name == "__metadata__" {
                if let Some(obj) = value.as_object() {
                    for (k, v) in obj {
                        metadata.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
                    }
                }
                continue;
            }
            let entry: RawEntry = serde_json::from_value(value)?;
            let value_type = value_type_from_dtype(&entry.dtype);
            let [start, end] = entry.data_offsets;
            let declared_size = end.checked_sub(start).ok_or_else(|| {
                TensorReaderError::InconsistentOffsets(format!(
                    "{name}: data_offsets end {end} precedes start {start}"
                ))
            })?;
            let stride = TensorInfo::row_major_stride(&entry.shape);
            if let Some(expected) = TensorInfo::row_major_size(value_type, &entry.shape) {
                if expected != declared_size && value_type != ValueType::Unknown {
                    return Err(TensorReaderError::InconsistentOffsets(format!(
                        "{name}: declared size {declared_size} does not match {expected} implied by shape {:?} and dtype {}",
                        entry.shape, entry.dtype
                    )));
                }
            }
            infos.push(TensorInfo {
                name,
                offset_start: start,
                size_bytes: declared_size,
                value_type,
                shape: entry.shape,
                stride,
            });
        }

        // `raw` iterates in BTreeMap key (name) order; sort into offset order
        // per the universal "sorted by offset_start" invariant.
        infos.sort_by_key(|t| t.offset_start);

        let data_size = infos.iter().map(|t| t.offset_start + t.size_bytes).max().unwrap_or(0);
        validate_contiguous(&infos, data_size)?;

        let data_offset = 8 + header_len;
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

    /// The `__metadata__` string table, if the file carried one.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Checks that the declared tensor spans sorted by offset tile the data
/// section exactly: start at zero, no gaps, no overlap, and the last span
/// ends exactly at `data_size`.
fn validate_contiguous(infos: &[TensorInfo], data_size: u64) -> Result<(), TensorReaderError> {
    if infos.is_empty() {
        return Ok(());
    }
    let mut sorted: Vec<&TensorInfo> = infos.iter().collect();
    sorted.sort_by_key(|t| t.offset_start);
    let mut cursor = 0u64;
    for t in &sorted {
        if t.offset_start != cursor {
            return Err(TensorReaderError::InconsistentOffsets(format!(
                "{}: expected offset {cursor}, found {}",
                t.name, t.offset_start
            )));
        }
        cursor = t.offset_start + t.size_bytes;
    }
    if cursor != data_size {
        return Err(TensorReaderError::InconsistentOffsets(format!(
            "tensor spans cover {cursor} bytes but the data section is {data_size}"
        )));
    }
    Ok(())
}

fn value_type_from_dtype(dtype: &str) -> ValueType {
    match dtype {
        "F64" => ValueType::F64,
        "F32" => ValueType::F32,
        "F16" => ValueType::F16,
        "BF16" => ValueType::Bf16,
        "I64" => ValueType::I64,
        "I32" => ValueType::I32,
        "I16" => ValueType::I16,
        "I8" => ValueType::I8,
        "U8" => ValueType::U8,
        "U16" => ValueType::U16,
        "U32" => ValueType::U32,
        "U64" => ValueType::U64,
        "BOOL" => ValueType::Bool,
        "F8_E4M3" => ValueType::F8E4M3,
        "F8_E5M2" => ValueType::F8E5M2,
        _ => ValueType::Unknown,
    }
}

impl Storage for SafetensorsReader {
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

impl TensorReader for SafetensorsReader {
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

    fn build_file(entries_json: &str, data: &[u8]) -> Vec<u8> {
        let header = entries_json.as_bytes();
        let mut out = Vec::new();
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(header);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn parses_three_tensors_with_contiguous_offsets() {
        let json = r#"{
            "a": {"dtype": "F32", "shape": [2, 2], "data_offsets": [0, 16]},
            "b": {"dtype": "I64", "shape": [2], "data_offsets": [16, 32]},
            "__metadata__": {"format": "pt"},
            "c": {"dtype": "U8", "shape": [4], "data_offsets": [32, 36]}
        }"#;
        let data = vec![0u8; 36];
        let bytes = build_file(json, &data);
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        let mut reader = SafetensorsReader::open(backing).unwrap();
        assert_eq!(reader.metadata().get("format").map(String::as_str), Some("pt"));
        assert!(reader.read_next_buffer().unwrap());
        assert_eq!(reader.tensors_in_buffer().len(), 3);
        assert_eq!(reader.buffer_size(), 36);
        assert!(!reader.read_next_buffer().unwrap());
    }

    #[test]
    fn rejects_a_gap_between_tensors() {
        let json = r#"{
            "a": {"dtype": "U8", "shape": [4], "data_offsets": [0, 4]},
            "b": {"dtype": "U8", "shape": [4], "data_offsets": [8, 12]}
        }"#;
        let bytes = build_file(json, &[0u8; 12]);
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        assert!(matches!(
            SafetensorsReader::open(backing),
            Err(TensorReaderError::InconsistentOffsets(_))
        ));
    }

    #[test]
    fn read_all_tensor_infos_uses_sentinel_offsets() {
        let json = r#"{"a": {"dtype": "F32", "shape": [1], "data_offsets": [0, 4]}}"#;
        let bytes = build_file(json, &[0u8; 4]);
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        let reader = SafetensorsReader::open(backing).unwrap();
        let infos = reader.read_all_tensor_infos();
        assert_eq!(infos[0].offset_start, crate::tensor::reader::OFFSET_UNKNOWN);
    }
}

//! Format auto-detection (spec.md §4.9) and the top-level `read_tensors`
//! entry point (spec.md §6): peek a handful of bytes to tell the three
//! container formats apart without consuming the storage's position, the
//! same `ReadFlags::PEEK` idiom `pickle::parse` uses to look ahead one
//! opcode before committing to it.

use crate::error::TensorReaderError;
use crate::storage::{ReadFlags, SharedStorage};
use crate::tensor::gguf::GgufReader;
use crate::tensor::pytorch::PyTorchReader;
use crate::tensor::reader::TensorReader;
use crate::tensor::safetensors::SafetensorsReader;
use crate::tensor::splitter::BufferSplitter;

const ZIP_LOCAL_FILE_HEADER: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Sniffs the container format from its leading bytes and opens the
/// matching reader. GGUF starts with the literal magic `"GGUF"`; PyTorch
/// checkpoints are ZIP archives, identified by the local file header
/// signature; Safetensors has no magic of its own, but its 8-byte header
/// length is always followed by a JSON object, so byte 8 being `{` is
/// enough to tell it apart from the other two.
pub fn detect_and_open(backing: SharedStorage) -> Result<Box<dyn TensorReader>, TensorReaderError> {
    let peeked = backing
        .read(12, ReadFlags::PEEK | ReadFlags::ALLOW_PARTIAL | ReadFlags::ALLOW_EMPTY)?
        .into_owned();

    if peeked.starts_with(b"GGUF") {
        return Ok(Box::new(GgufReader::open(backing)?));
    }
    if peeked.starts_with(&ZIP_LOCAL_FILE_HEADER) {
        return Ok(Box::new(PyTorchReader::open(backing)?));
    }
    if peeked.len() > 8 && peeked[8] == b'{' {
        return Ok(Box::new(SafetensorsReader::open(backing)?));
    }
    Err(TensorReaderError::UnknownFormat)
}

/// Opens `backing` with whichever reader its format sniffs as, optionally
/// wrapping it in a [`BufferSplitter`] so that no single buffer spans more
/// than one maximal run of overlapping tensors (spec.md §4.8).
pub fn read_tensors(
    backing: SharedStorage,
    small_buffers: bool,
) -> Result<Box<dyn TensorReader>, TensorReaderError> {
    let reader = detect_and_open(backing)?;
    if small_buffers {
        Ok(Box::new(BufferSplitter::new(reader)))
    } else {
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::rc::Rc;

    #[test]
    fn detects_gguf_by_magic() {
        let mut bytes = b"GGUF".to_vec();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        assert!(detect_and_open(backing).is_ok());
    }

    #[test]
    fn detects_safetensors_by_header_shape() {
        let json = br#"{"a": {"dtype": "U8", "shape": [1], "data_offsets": [0, 1]}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        bytes.push(0u8);
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        assert!(detect_and_open(backing).is_ok());
    }

    #[test]
    fn rejects_unrecognised_bytes() {
        let backing: SharedStorage = Rc::new(MemoryStorage::new(vec![0xffu8; 16]));
        assert!(matches!(
            detect_and_open(backing),
            Err(TensorReaderError::UnknownFormat)
        ));
    }
}

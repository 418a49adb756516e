//! Read-only, format-agnostic access to Safetensors, PyTorch, and GGUF
//! tensor containers, built on three pieces (spec.md §1): a storage
//! abstraction any byte source plugs into, a pickle interpreter for the
//! object graph PyTorch checkpoints embed, and a tensor-reader state
//! machine that turns each format's own framing into one shared
//! buffer-iteration contract.

pub mod error;
pub mod pickle;
pub mod storage;
pub mod tensor;
pub mod util;
pub mod zip;

use std::path::Path;
use std::rc::Rc;

pub use error::{PickleError, StorageError, TensorReaderError};
pub use pickle::{decode as decode_pickle, Item, ItemRef, ItemType, StringEncoding};
pub use storage::{ReadBuf, ReadFlags, SharedStorage, Storage};
pub use tensor::{
    read_tensors, BufferSplitter, BufferView, GgufReader, PyTorchReader, SafetensorsReader,
    TensorInfo, TensorReader, ValueType, OFFSET_UNKNOWN,
};

use storage::file::FileStorage;
use storage::memory::MemoryStorage;

#[cfg(feature = "gzip")]
use storage::gzip::GzipStorage;

#[cfg(feature = "mmap")]
use storage::mmap::MmapStorage;

/// Opens a plain file as a sequentially-read, lazily-seek-detecting
/// storage (spec.md §4.1 / §6).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<SharedStorage, StorageError> {
    Ok(Rc::new(FileStorage::open(path)?))
}

/// Opens a file as a memory-mapped storage, giving every reader built on
/// top of it zero-copy, freely-seekable reads.
#[cfg(feature = "mmap")]
pub fn open_mmap<P: AsRef<Path>>(path: P) -> Result<SharedStorage, StorageError> {
    Ok(Rc::new(MmapStorage::open(path)?))
}

/// Opens a gzip-compressed file as a forward-only storage.
#[cfg(feature = "gzip")]
pub fn open_gzip<P: AsRef<Path>>(path: P) -> Result<SharedStorage, StorageError> {
    Ok(Rc::new(GzipStorage::open(path)?))
}

/// Wraps an in-memory buffer as a fully-seekable storage.
pub fn from_memory(data: Vec<u8>) -> SharedStorage {
    Rc::new(MemoryStorage::new(data))
}

/// Opens `backing` with the Safetensors reader directly, bypassing format
/// sniffing for callers that already know the container's shape.
pub fn safetensors_reader(backing: SharedStorage) -> Result<SafetensorsReader, TensorReaderError> {
    SafetensorsReader::open(backing)
}

/// Opens `backing` with the GGUF reader directly.
pub fn gguf_reader(backing: SharedStorage) -> Result<GgufReader, TensorReaderError> {
    GgufReader::open(backing)
}

/// Opens `backing` with the PyTorch checkpoint reader directly.
pub fn pytorch_reader(backing: SharedStorage) -> Result<PyTorchReader, TensorReaderError> {
    PyTorchReader::open(backing)
}

//! Read-only, format-agnostic tensor container access (spec.md §4): one
//! shared `TensorReader` contract (`reader`) implemented by three concrete
//! parsers (`safetensors`, `gguf`, `pytorch`), a buffer-regrouping
//! decorator (`splitter`), and format sniffing plus the top-level entry
//! point (`detect`).

pub mod detect;
pub mod gguf;
pub mod pytorch;
pub mod reader;
pub mod safetensors;
pub mod splitter;

pub use detect::{detect_and_open, read_tensors};
pub use gguf::{GgufReader, GgufValue};
pub use pytorch::PyTorchReader;
pub use reader::{BufferView, TensorInfo, TensorReader, ValueType, OFFSET_UNKNOWN};
pub use safetensors::SafetensorsReader;
pub use splitter::BufferSplitter;

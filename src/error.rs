//! The error taxonomy described in spec.md §7: storage errors, pickle
//! errors, and tensor-reader errors, wired together with `#[from]` so each
//! layer can freely wrap the layer below it.

/// Failures that originate in the storage layer: end-of-stream, seek
/// failures, and failure to open a backing resource.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("end of stream: requested {requested} byte(s), {available} available")]
    EndOfStream { requested: u64, available: u64 },

    #[error("cannot seek backward on this storage")]
    BackwardSeekUnsupported,

    #[error("cannot seek before the start of the storage (requested {0})")]
    SeekBeforeStart(i64),

    #[error("seek failed: {0}")]
    SeekFailed(String),

    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("read past the end of a bounded region (offset {offset}, region size {size})")]
    RegionOverrun { offset: u64, size: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures raised while executing the pickle stack machine.
#[derive(Debug, thiserror::Error)]
pub enum PickleError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("missing MARK on the stack")]
    MissingMark,

    #[error("missing memo entry {0}")]
    MissingMemo(u32),

    #[error("bad stack top for {0}")]
    BadStackTop(&'static str),

    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("STOP reached with {0} item(s) on the stack, expected exactly 1")]
    BadFinalStack(usize),

    #[error("STOP reached with an unterminated MARK")]
    UnterminatedMark,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures raised by the three format parsers and the buffer splitter.
#[derive(Debug, thiserror::Error)]
pub enum TensorReaderError {
    #[error("unrecognized tensor container format")]
    UnknownFormat,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u64),

    #[error("inconsistent tensor offsets: {0}")]
    InconsistentOffsets(String),

    #[error("unsupported gguf alignment {0} (must be non-zero and a multiple of 8)")]
    UnsupportedAlignment(u64),

    #[error("missing pytorch storage member {0}")]
    MissingStorage(String),

    #[error("unexpected first zip entry {0:?}, expected a path ending in /data.pkl")]
    UnexpectedFirstEntry(String),

    #[error("shape/stride mismatch: {0}")]
    ShapeStrideMismatch(String),

    #[error("arithmetic overflow computing size_bytes")]
    Overflow,

    #[error("unexpected value in pickle tree: {0}")]
    UnexpectedPickleShape(String),

    #[error("zip archive error: {0}")]
    Zip(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pickle(#[from] PickleError),

    #[error("invalid safetensors header JSON: {0}")]
    Json(#[from] serde_json::Error),
}

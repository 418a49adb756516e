//! Gzip stream storage. Decompression is delegated to `flate2` per
//! spec.md §4.1 ("gzip: uses a standard gzip library; not seekable
//! backward; forward seek is emulated by read-and-discard").

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::StorageError;
use crate::storage::stream::Lookahead;
use crate::storage::{ReadBuf, ReadFlags, Storage};

pub struct GzipStorage {
    inner: Lookahead<GzDecoder<File>>,
}

impl GzipStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            inner: Lookahead::new(GzDecoder::new(file)),
        })
    }
}

impl Storage for GzipStorage {
    fn current_position(&self) -> u64 {
        self.inner.position()
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
        let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);
        if flags.contains(ReadFlags::PEEK) {
            Ok(ReadBuf::Owned(self.inner.peek(length)?))
        } else {
            Ok(ReadBuf::Owned(
                self.inner.read(length, allow_partial, allow_empty)?,
            ))
        }
    }

    fn can_seek_back(&self, _allow_detect: bool) -> bool {
        false
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        let cur = self.current_position();
        if absolute < cur {
            return Err(StorageError::BackwardSeekUnsupported);
        }
        tracing::trace!(bytes = absolute - cur, "emulating forward seek on gzip stream");
        self.inner.skip_forward(absolute - cur)
    }

    fn seek_from_back(&self, _absolute_from_end: u64) -> Result<(), StorageError> {
        Err(StorageError::BackwardSeekUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        let mut enc = GzEncoder::new(f.reopen().unwrap(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap();
        f
    }

    #[test]
    fn sequential_read_round_trips() {
        let f = fixture(b"the quick brown fox");
        let s = GzipStorage::open(f.path()).unwrap();
        assert_eq!(s.read(9, ReadFlags::NONE).unwrap().as_slice(), b"the quick");
        assert_eq!(
            s.read(10, ReadFlags::NONE).unwrap().as_slice(),
            b" brown fox"
        );
    }

    #[test]
    fn forward_seek_is_emulated() {
        let f = fixture(b"0123456789");
        let s = GzipStorage::open(f.path()).unwrap();
        s.seek_to(4).unwrap();
        assert_eq!(s.read(3, ReadFlags::NONE).unwrap().as_slice(), b"456");
    }

    #[test]
    fn backward_seek_fails() {
        let f = fixture(b"0123456789");
        let s = GzipStorage::open(f.path()).unwrap();
        let _ = s.read(5, ReadFlags::NONE).unwrap();
        assert!(s.seek_to(1).is_err());
        assert!(!s.can_seek_back(true));
    }
}

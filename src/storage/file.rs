//! Sequential file storage with lazily-detected seekability, per spec.md
//! §4.1: "detects seekability by attempting a no-op seek; on success
//! caches the capability."

use std::cell::Cell;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::error::StorageError;
use crate::storage::stream::Lookahead;
use crate::storage::{ReadBuf, ReadFlags, Storage};

pub struct FileStorage {
    inner: Lookahead<File>,
    seekable: Cell<Option<bool>>,
    len: Option<u64>,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let len = file.metadata().ok().map(|m| m.len());
        Ok(Self {
            inner: Lookahead::new(file),
            seekable: Cell::new(None),
            len,
        })
    }

    fn probe_seekable(&self) -> bool {
        if let Some(v) = self.seekable.get() {
            return v;
        }
        let ok = self
            .inner
            .with_reader_mut(|f| f.seek(SeekFrom::Current(0)).is_ok());
        tracing::debug!(seekable = ok, "file storage seekability probe");
        self.seekable.set(Some(ok));
        ok
    }
}

impl Storage for FileStorage {
    fn current_position(&self) -> u64 {
        self.inner.position()
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
        let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);
        if flags.contains(ReadFlags::PEEK) {
            Ok(ReadBuf::Owned(self.inner.peek(length)?))
        } else {
            Ok(ReadBuf::Owned(self.inner.read(length, allow_partial, allow_empty)?))
        }
    }

    fn can_seek_back(&self, allow_detect: bool) -> bool {
        match self.seekable.get() {
            Some(v) => v,
            None if allow_detect => self.probe_seekable(),
            None => false,
        }
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        let cur = self.current_position();
        if absolute >= cur {
            return self.inner.skip_forward(absolute - cur);
        }
        if !self.can_seek_back(true) {
            return Err(StorageError::BackwardSeekUnsupported);
        }
        self.inner
            .with_reader_mut(|f| f.seek(SeekFrom::Start(absolute)))
            .map_err(|e| StorageError::SeekFailed(e.to_string()))?;
        self.inner.reset(absolute);
        Ok(())
    }

    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        if !self.can_seek_back(true) {
            return Err(StorageError::BackwardSeekUnsupported);
        }
        let pos = self
            .inner
            .with_reader_mut(|f| f.seek(SeekFrom::End(-(absolute_from_end as i64))))
            .map_err(|e| StorageError::SeekFailed(e.to_string()))?;
        self.inner.reset(pos);
        Ok(())
    }

    fn close(&self) {}

    fn len_hint(&self) -> Option<u64> {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn sequential_read_and_peek() {
        let f = fixture(b"0123456789");
        let s = FileStorage::open(f.path()).unwrap();
        assert_eq!(s.read(4, ReadFlags::PEEK).unwrap().as_slice(), b"0123");
        assert_eq!(s.current_position(), 0);
        assert_eq!(s.read(4, ReadFlags::NONE).unwrap().as_slice(), b"0123");
        assert_eq!(s.current_position(), 4);
        assert_eq!(s.read(6, ReadFlags::NONE).unwrap().as_slice(), b"456789");
    }

    #[test]
    fn seek_then_read_matches_direct_read() {
        let f = fixture(b"abcdefghij");
        let s = FileStorage::open(f.path()).unwrap();
        s.seek_to(3).unwrap();
        let a = s.read(4, ReadFlags::NONE).unwrap().into_owned();

        let s2 = FileStorage::open(f.path()).unwrap();
        s2.seek_to(0).unwrap();
        let _ = s2.read(3, ReadFlags::NONE).unwrap();
        let b = s2.read(4, ReadFlags::NONE).unwrap().into_owned();
        assert_eq!(a, b);
    }

    #[test]
    fn end_of_stream_without_allow_flags_errors() {
        let f = fixture(b"ab");
        let s = FileStorage::open(f.path()).unwrap();
        assert!(s.read(10, ReadFlags::NONE).is_err());
    }

    #[test]
    fn allow_partial_returns_short_read() {
        let f = fixture(b"ab");
        let s = FileStorage::open(f.path()).unwrap();
        let got = s.read(10, ReadFlags::ALLOW_PARTIAL).unwrap();
        assert_eq!(got.as_slice(), b"ab");
    }
}

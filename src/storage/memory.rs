//! In-memory buffer storage. Identical semantics to the memory-mapped
//! storage (spec.md §4.1): all reads are zero-copy borrows of the owned
//! buffer, and the storage is fully seekable in both directions.

use std::cell::Cell;

use crate::error::StorageError;
use crate::storage::{ReadBuf, ReadFlags, Storage};

pub struct MemoryStorage {
    data: Vec<u8>,
    position: Cell<u64>,
}

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            position: Cell::new(0),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn current_position(&self) -> u64 {
        self.position.get()
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let pos = self.position.get() as usize;
        let total = self.data.len();
        let avail = total.saturating_sub(pos) as u64;
        let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
        let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);

        if avail == 0 && length > 0 {
            if !allow_empty {
                return Err(StorageError::EndOfStream {
                    requested: length,
                    available: 0,
                });
            }
        } else if avail < length && !allow_partial {
            return Err(StorageError::EndOfStream {
                requested: length,
                available: avail,
            });
        }

        let take = length.min(avail) as usize;
        let slice = &self.data[pos..pos + take];
        if !flags.contains(ReadFlags::PEEK) {
            self.position.set((pos + take) as u64);
        }
        Ok(ReadBuf::Borrowed(slice))
    }

    fn can_seek_back(&self, _allow_detect: bool) -> bool {
        true
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        if absolute as usize > self.data.len() {
            return Err(StorageError::SeekFailed(format!(
                "seek to {absolute} beyond end of {}-byte buffer",
                self.data.len()
            )));
        }
        self.position.set(absolute);
        Ok(())
    }

    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        let len = self.data.len() as u64;
        if absolute_from_end > len {
            return Err(StorageError::SeekBeforeStart(
                len as i64 - absolute_from_end as i64,
            ));
        }
        self.position.set(len - absolute_from_end);
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_then_read_matches_direct_read() {
        let data = (0u8..20).collect::<Vec<_>>();
        let s = MemoryStorage::new(data.clone());
        s.seek_to(5).unwrap();
        let a = s.read(4, ReadFlags::NONE).unwrap().into_owned();
        assert_eq!(a, &data[5..9]);
    }

    #[test]
    fn peek_is_zero_copy_and_non_advancing() {
        let s = MemoryStorage::new(vec![1, 2, 3, 4, 5]);
        let v = s.read(3, ReadFlags::PEEK).unwrap();
        assert!(matches!(v, ReadBuf::Borrowed(_)));
        assert_eq!(s.current_position(), 0);
    }

    #[test]
    fn end_of_stream_respects_flags() {
        let s = MemoryStorage::new(vec![1, 2]);
        assert!(s.read(5, ReadFlags::NONE).is_err());
        assert_eq!(
            s.read(5, ReadFlags::ALLOW_PARTIAL).unwrap().as_slice(),
            &[1, 2]
        );
        let empty = MemoryStorage::new(vec![]);
        assert!(empty.read(1, ReadFlags::NONE).is_err());
        assert!(empty.read(1, ReadFlags::ALLOW_EMPTY).unwrap().is_empty());
    }
}

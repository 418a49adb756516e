//! Region-scoped sub-reads (spec.md §4.7/§9): a `(region_offset,
//! region_size)` pair over a backing storage, exposed itself as a
//! `Storage` so tensor-reader buffers and, recursively, the buffer
//! splitter can all be built out of the same clamp-and-delegate view.

use std::cell::Cell;

use crate::error::StorageError;
use crate::storage::{ReadBuf, ReadFlags, SharedStorage, Storage};

pub struct RegionStorage {
    backing: SharedStorage,
    region_offset: u64,
    region_size: u64,
    local_position: Cell<u64>,
}

impl RegionStorage {
    pub fn new(backing: SharedStorage, region_offset: u64, region_size: u64) -> Self {
        Self {
            backing,
            region_offset,
            region_size,
            local_position: Cell::new(0),
        }
    }

    pub fn region_offset(&self) -> u64 {
        self.region_offset
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }
}

impl Storage for RegionStorage {
    fn current_position(&self) -> u64 {
        self.local_position.get()
    }

    fn original_position(&self) -> u64 {
        self.region_offset + self.local_position.get()
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let local = self.local_position.get();
        let remaining = self.region_size.saturating_sub(local);
        let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
        let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);

        if remaining == 0 && length > 0 {
            if !allow_empty {
                return Err(StorageError::RegionOverrun {
                    offset: local,
                    size: self.region_size,
                });
            }
        } else if remaining < length && !allow_partial {
            return Err(StorageError::RegionOverrun {
                offset: local,
                size: self.region_size,
            });
        }
        let take = length.min(remaining);

        let abs = self.region_offset + local;
        if self.backing.current_position() != abs {
            self.backing.seek_to(abs)?;
        }
        let data = self.backing.read(take, flags)?;
        if !flags.contains(ReadFlags::PEEK) {
            self.local_position.set(local + take);
        }
        Ok(data)
    }

    fn can_seek_back(&self, allow_detect: bool) -> bool {
        self.backing.can_seek_back(allow_detect)
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        if absolute > self.region_size {
            return Err(StorageError::SeekFailed(format!(
                "seek to {absolute} beyond region size {}",
                self.region_size
            )));
        }
        if absolute < self.local_position.get() && !self.can_seek_back(true) {
            return Err(StorageError::BackwardSeekUnsupported);
        }
        self.local_position.set(absolute);
        Ok(())
    }

    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        if !self.can_seek_back(true) {
            return Err(StorageError::BackwardSeekUnsupported);
        }
        if absolute_from_end > self.region_size {
            return Err(StorageError::SeekBeforeStart(
                self.region_size as i64 - absolute_from_end as i64,
            ));
        }
        self.local_position.set(self.region_size - absolute_from_end);
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.region_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::rc::Rc;

    #[test]
    fn clamps_to_region_bounds() {
        let backing: SharedStorage = Rc::new(MemoryStorage::new((0u8..100).collect()));
        let region = RegionStorage::new(backing, 10, 5);
        assert_eq!(
            region.read(5, ReadFlags::NONE).unwrap().as_slice(),
            &[10, 11, 12, 13, 14]
        );
        assert!(region.read(1, ReadFlags::NONE).is_err());
        assert!(region
            .read(1, ReadFlags::ALLOW_EMPTY)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn region_relative_position_starts_at_zero() {
        let backing: SharedStorage = Rc::new(MemoryStorage::new((0u8..100).collect()));
        let region = RegionStorage::new(backing, 50, 10);
        assert_eq!(region.current_position(), 0);
        let _ = region.read(3, ReadFlags::NONE).unwrap();
        assert_eq!(region.current_position(), 3);
        assert_eq!(region.original_position(), 53);
    }
}

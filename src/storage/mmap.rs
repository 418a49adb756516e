//! Memory-mapped file storage. Grounded on
//! `other_examples/e559e7fd_iZoom786-chatloop..safetensors.rs`, which maps
//! a file with `memmap2::Mmap` and slices directly into it for zero-copy
//! tensor views; we generalize the same trick to the generic `Storage`
//! contract instead of one format-specific reader.

use std::cell::Cell;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::StorageError;
use crate::storage::{ReadBuf, ReadFlags, Storage};

pub struct MmapStorage {
    mmap: Mmap,
    position: Cell<u64>,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        // SAFETY: the mapped file must not be truncated or written to by
        // another process for the lifetime of this mapping. This mirrors
        // the same unchecked assumption every mmap-backed tensor loader in
        // the ecosystem makes (the file is a read-only model artifact).
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            mmap,
            position: Cell::new(0),
        })
    }
}

impl Storage for MmapStorage {
    fn current_position(&self) -> u64 {
        self.position.get()
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let pos = self.position.get() as usize;
        let total = self.mmap.len();
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
        let slice = &self.mmap[pos..pos + take];
        if !flags.contains(ReadFlags::PEEK) {
            self.position.set((pos + take) as u64);
        }
        Ok(ReadBuf::Borrowed(slice))
    }

    fn can_seek_back(&self, _allow_detect: bool) -> bool {
        true
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        if absolute as usize > self.mmap.len() {
            return Err(StorageError::SeekFailed(format!(
                "seek to {absolute} beyond end of {}-byte mapping",
                self.mmap.len()
            )));
        }
        self.position.set(absolute);
        Ok(())
    }

    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        let len = self.mmap.len() as u64;
        if absolute_from_end > len {
            return Err(StorageError::SeekBeforeStart(
                len as i64 - absolute_from_end as i64,
            ));
        }
        self.position.set(len - absolute_from_end);
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.mmap.len() as u64)
    }
}

//! Buffer splitter (spec.md §4.8): regroups a `TensorReader`'s buffers so
//! that each outgoing buffer holds exactly one maximal run of
//! transitively-overlapping tensors — the common case for PyTorch, where
//! several tensors alias slices of the same storage. A tensor with no
//! overlap becomes a singleton buffer of its own; a storage with no
//! tensors at all (padding, or a reference-counted buffer nothing reads
//! from) still becomes one empty buffer rather than disappearing.
//!
//! Grounded on `storage::region::RegionStorage`'s clamp-and-delegate
//! read, reimplemented directly against a generic `R: TensorReader`
//! instead of a `SharedStorage`, since the splitter owns its inner
//! reader outright rather than sharing it by reference count.

use std::cell::Cell;
use std::collections::VecDeque;

use crate::error::{StorageError, TensorReaderError};
use crate::storage::{ReadBuf, ReadFlags, Storage};
use crate::tensor::reader::{TensorInfo, TensorReader};

struct Run {
    /// Offset of this run within the wrapped reader's current buffer.
    offset: u64,
    size: u64,
    /// Offsets here are already rebased to be relative to this run.
    tensors: Vec<TensorInfo>,
}

/// Wraps any `TensorReader` and re-splits its buffers along tensor
/// overlap boundaries.
pub struct BufferSplitter<R: TensorReader> {
    inner: R,
    pending: VecDeque<Run>,
    current: Option<Run>,
    local_position: Cell<u64>,
}

impl<R: TensorReader> BufferSplitter<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            current: None,
            local_position: Cell::new(0),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: TensorReader> Storage for BufferSplitter<R> {
    fn current_position(&self) -> u64 {
        self.local_position.get()
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let run = self.current.as_ref().ok_or(StorageError::EndOfStream {
            requested: length,
            available: 0,
        })?;
        let local = self.local_position.get();
        let remaining = run.size.saturating_sub(local);
        let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
        let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);

        if remaining == 0 && length > 0 {
            if !allow_empty {
                return Err(StorageError::EndOfStream {
                    requested: length,
                    available: 0,
                });
            }
        } else if remaining < length && !allow_partial {
            return Err(StorageError::EndOfStream {
                requested: length,
                available: remaining,
            });
        }
        let take = length.min(remaining);

        let abs = run.offset + local;
        if self.inner.current_position() != abs {
            self.inner.seek_to(abs)?;
        }
        let data = self.inner.read(take, flags)?.into_owned();
        if !flags.contains(ReadFlags::PEEK) {
            self.local_position.set(local + take);
        }
        Ok(ReadBuf::Owned(data))
    }

    fn can_seek_back(&self, allow_detect: bool) -> bool {
        self.inner.can_seek_back(allow_detect)
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        let size = self.current.as_ref().map(|r| r.size).unwrap_or(0);
        if absolute > size {
            return Err(StorageError::SeekFailed(format!(
                "seek to {absolute} beyond split buffer size {size}"
            )));
        }
        self.local_position.set(absolute);
        Ok(())
    }

    fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
        let size = self.current.as_ref().map(|r| r.size).unwrap_or(0);
        if absolute_from_end > size {
            return Err(StorageError::SeekBeforeStart(
                size as i64 - absolute_from_end as i64,
            ));
        }
        self.local_position.set(size - absolute_from_end);
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.size)
    }
}

impl<R: TensorReader> TensorReader for BufferSplitter<R> {
    fn read_next_buffer(&mut self) -> Result<bool, TensorReaderError> {
        loop {
            if let Some(run) = self.pending.pop_front() {
                self.local_position.set(0);
                self.current = Some(run);
                return Ok(true);
            }
            if !self.inner.read_next_buffer()? {
                self.current = None;
                return Ok(false);
            }
            self.pending = split_into_runs(self.inner.tensors_in_buffer(), self.inner.buffer_size());
        }
    }

    fn tensors_in_buffer(&self) -> &[TensorInfo] {
        self.current.as_ref().map(|r| r.tensors.as_slice()).unwrap_or(&[])
    }

    fn buffer_size(&self) -> u64 {
        self.current.as_ref().map(|r| r.size).unwrap_or(0)
    }

    fn all_infos(&self) -> &[TensorInfo] {
        self.inner.all_infos()
    }
}

/// Groups `tensors` (offsets relative to the wrapped buffer) into maximal
/// overlapping runs via an interval-merge sweep over offsets sorted
/// ascending, then rebases each run's tensors to be relative to the run's
/// own start. A buffer with no tensors still yields one empty run
/// spanning the whole buffer rather than none.
fn split_into_runs(tensors: &[TensorInfo], buffer_size: u64) -> VecDeque<Run> {
    if tensors.is_empty() {
        let mut runs = VecDeque::with_capacity(1);
        runs.push_back(Run {
            offset: 0,
            size: buffer_size,
            tensors: Vec::new(),
        });
        return runs;
    }

    let mut sorted: Vec<TensorInfo> = tensors.to_vec();
    sorted.sort_by_key(|t| t.offset_start);

    let mut runs = VecDeque::new();
    let mut run_start = sorted[0].offset_start;
    let mut run_end = sorted[0].offset_start + sorted[0].size_bytes;
    let mut bucket = vec![sorted[0].clone()];

    for t in &sorted[1..] {
        if t.offset_start < run_end {
            run_end = run_end.max(t.offset_start + t.size_bytes);
            bucket.push(t.clone());
        } else {
            runs.push_back(finish_run(run_start, run_end, std::mem::take(&mut bucket)));
            run_start = t.offset_start;
            run_end = t.offset_start + t.size_bytes;
            bucket.push(t.clone());
        }
    }
    runs.push_back(finish_run(run_start, run_end, bucket));
    runs
}

fn finish_run(start: u64, end: u64, tensors: Vec<TensorInfo>) -> Run {
    let rebased = tensors
        .into_iter()
        .map(|mut t| {
            t.offset_start -= start;
            t
        })
        .collect();
    Run {
        offset: start,
        size: end - start,
        tensors: rebased,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::tensor::reader::ValueType;

    /// A trivial fixed-buffer `TensorReader` for exercising the splitter
    /// in isolation, without going through a real container format.
    struct FixedReader {
        backing: MemoryStorage,
        infos: Vec<TensorInfo>,
        opened: bool,
    }

    impl Storage for FixedReader {
        fn current_position(&self) -> u64 {
            self.backing.current_position()
        }
        fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
            self.backing.read(length, flags)
        }
        fn can_seek_back(&self, allow_detect: bool) -> bool {
            self.backing.can_seek_back(allow_detect)
        }
        fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
            self.backing.seek_to(absolute)
        }
        fn seek_from_back(&self, absolute_from_end: u64) -> Result<(), StorageError> {
            self.backing.seek_from_back(absolute_from_end)
        }
    }

    impl TensorReader for FixedReader {
        fn read_next_buffer(&mut self) -> Result<bool, TensorReaderError> {
            let first = !self.opened;
            self.opened = true;
            Ok(first)
        }
        fn tensors_in_buffer(&self) -> &[TensorInfo] {
            &self.infos
        }
        fn buffer_size(&self) -> u64 {
            self.backing.len()
        }
        fn all_infos(&self) -> &[TensorInfo] {
            &self.infos
        }
    }

    fn info(name: &str, offset: u64, size: u64) -> TensorInfo {
        TensorInfo {
            name: name.to_string(),
            offset_start: offset,
            size_bytes: size,
            value_type: ValueType::U8,
            shape: vec![size],
            stride: vec![1],
        }
    }

    #[test]
    fn disjoint_tensors_become_singleton_buffers() {
        let reader = FixedReader {
            backing: MemoryStorage::new(vec![0u8; 20]),
            infos: vec![info("a", 0, 4), info("b", 10, 4)],
            opened: false,
        };
        let mut splitter = BufferSplitter::new(reader);
        assert!(splitter.read_next_buffer().unwrap());
        assert_eq!(splitter.tensors_in_buffer().len(), 1);
        assert_eq!(splitter.tensors_in_buffer()[0].name, "a");
        assert!(splitter.read_next_buffer().unwrap());
        assert_eq!(splitter.tensors_in_buffer()[0].name, "b");
        assert!(!splitter.read_next_buffer().unwrap());
    }

    #[test]
    fn overlapping_tensors_merge_into_one_run_with_rebased_offsets() {
        let reader = FixedReader {
            backing: MemoryStorage::new(vec![0u8; 20]),
            infos: vec![info("slice1", 0, 8), info("slice2", 4, 8)],
            opened: false,
        };
        let mut splitter = BufferSplitter::new(reader);
        assert!(splitter.read_next_buffer().unwrap());
        let tensors = splitter.tensors_in_buffer();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].offset_start, 0);
        assert_eq!(tensors[1].offset_start, 4);
        assert_eq!(splitter.buffer_size(), 12);
        assert!(!splitter.read_next_buffer().unwrap());
    }

    #[test]
    fn buffer_with_no_tensors_is_preserved_empty() {
        let reader = FixedReader {
            backing: MemoryStorage::new(vec![0u8; 5]),
            infos: vec![],
            opened: false,
        };
        let mut splitter = BufferSplitter::new(reader);
        assert!(splitter.read_next_buffer().unwrap());
        assert!(splitter.tensors_in_buffer().is_empty());
        assert_eq!(splitter.buffer_size(), 5);
    }
}

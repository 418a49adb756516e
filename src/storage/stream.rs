//! Shared lookahead buffering for sequential byte sources (`FileStorage`,
//! `GzipStorage`). Generalizes spec.md §4.1's "abstract streaming base" —
//! both sources need identical peek/partial-read bookkeeping over a plain
//! `Read` impl, so it is factored into one reusable type rather than
//! duplicated, the way the teacher factors `PickleStack`/`PickleMemo` out
//! of `eval.rs` instead of inlining stack/memo bookkeeping three times.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::Read;

use crate::error::StorageError;

const FILL_CHUNK: usize = 8192;

pub struct Lookahead<R> {
    reader: RefCell<R>,
    buf: RefCell<VecDeque<u8>>,
    position: Cell<u64>,
    eof: Cell<bool>,
}

impl<R: Read> Lookahead<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: RefCell::new(reader),
            buf: RefCell::new(VecDeque::new()),
            position: Cell::new(0),
            eof: Cell::new(false),
        }
    }

    /// Logical position: total bytes handed to the caller so far.
    pub fn position(&self) -> u64 {
        self.position.get()
    }

    fn fill(&self, want: usize) -> std::io::Result<()> {
        if self.eof.get() {
            return Ok(());
        }
        let mut buf = self.buf.borrow_mut();
        if buf.len() >= want {
            return Ok(());
        }
        let mut reader = self.reader.borrow_mut();
        let mut chunk = [0u8; FILL_CHUNK];
        while buf.len() < want {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                self.eof.set(true);
                break;
            }
            buf.extend(chunk[..n].iter().copied());
        }
        Ok(())
    }

    /// Look at up to `length` bytes without consuming them.
    pub fn peek(&self, length: u64) -> Result<Vec<u8>, StorageError> {
        self.fill(length as usize)?;
        let buf = self.buf.borrow();
        let n = (length as usize).min(buf.len());
        Ok(buf.iter().take(n).copied().collect())
    }

    /// Consume up to `length` bytes, applying the `allow_partial`/
    /// `allow_empty` rules from spec.md §4.1.
    pub fn read(
        &self,
        length: u64,
        allow_partial: bool,
        allow_empty: bool,
    ) -> Result<Vec<u8>, StorageError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        self.fill(length as usize)?;
        let mut buf = self.buf.borrow_mut();
        let avail = buf.len() as u64;
        if avail == 0 {
            return if allow_empty {
                Ok(Vec::new())
            } else {
                Err(StorageError::EndOfStream {
                    requested: length,
                    available: 0,
                })
            };
        }
        if avail < length && !allow_partial {
            return Err(StorageError::EndOfStream {
                requested: length,
                available: avail,
            });
        }
        let take = length.min(avail) as usize;
        let out: Vec<u8> = buf.drain(..take).collect();
        drop(buf);
        self.position.set(self.position.get() + take as u64);
        Ok(out)
    }

    /// Consume and discard `length` bytes, used to emulate a forward seek
    /// on a source that cannot actually seek (gzip streams).
    pub fn skip_forward(&self, length: u64) -> Result<(), StorageError> {
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(FILL_CHUNK as u64 * 4);
            let got = self.read(chunk, true, true)?;
            if got.is_empty() {
                break;
            }
            remaining -= got.len() as u64;
        }
        Ok(())
    }

    /// Discard any buffered lookahead and reset the logical position,
    /// used after a real seek on the underlying reader repositions it.
    pub fn reset(&self, new_position: u64) {
        self.buf.borrow_mut().clear();
        self.position.set(new_position);
        self.eof.set(false);
    }

    /// Run a closure with mutable access to the underlying reader, for
    /// storages that can perform a real seek on it.
    pub fn with_reader_mut<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut r = self.reader.borrow_mut();
        f(&mut r)
    }
}

impl<R> std::fmt::Debug for Lookahead<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookahead")
            .field("position", &self.position.get())
            .field("buffered", &self.buf.borrow().len())
            .field("eof", &self.eof.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn peek_does_not_consume() {
        let la = Lookahead::new(Cursor::new(b"hello world".to_vec()));
        assert_eq!(la.peek(5).unwrap(), b"hello");
        assert_eq!(la.peek(5).unwrap(), b"hello");
        assert_eq!(la.position(), 0);
    }

    #[test]
    fn read_advances_and_resumes() {
        let la = Lookahead::new(Cursor::new(b"hello world".to_vec()));
        assert_eq!(la.read(5, false, false).unwrap(), b"hello");
        assert_eq!(la.position(), 5);
        assert_eq!(la.read(6, false, false).unwrap(), b" world");
    }

    #[test]
    fn short_read_without_allow_partial_errors() {
        let la = Lookahead::new(Cursor::new(b"abc".to_vec()));
        assert!(la.read(10, false, false).is_err());
    }

    #[test]
    fn short_read_with_allow_partial_returns_what_is_there() {
        let la = Lookahead::new(Cursor::new(b"abc".to_vec()));
        assert_eq!(la.read(10, true, false).unwrap(), b"abc");
    }

    #[test]
    fn empty_at_eof_requires_allow_empty() {
        let la = Lookahead::new(Cursor::new(Vec::<u8>::new()));
        assert!(la.read(1, false, false).is_err());
        assert_eq!(la.read(1, false, true).unwrap(), Vec::<u8>::new());
    }
}

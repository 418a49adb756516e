//! ZIP reader implementing the storage contract (spec.md §4.2): seekable
//! mode driven by the central directory, streaming mode that walks local
//! headers sequentially and recovers length-at-end members by scanning for
//! a CRC32-validated data-descriptor. Grounded on
//! `other_examples/35ab2918_LPeter1997-Cacti__cacti_archive-src-zip.rs`'s
//! `EndOfCentralDirectoryRecord`/`FileHeader`/`LocalFileHeader` field
//! layouts and its backward scan for the EOCD signature.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::error::{StorageError, TensorReaderError};
use crate::storage::{read_exact, ReadBuf, ReadFlags, SharedStorage, Storage};
use crate::util::{le_u16, le_u32, le_u64, Crc32};

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
const EOCD64_SIGNATURE: u32 = 0x0606_4b50;
const CENTRAL_FILE_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const ZIP64_EXTRA_ID: u16 = 0x0001;

const FLAG_ENCRYPTED: u16 = 1 << 0;
const FLAG_LENGTH_AT_END: u16 = 1 << 3;

/// One entry in a ZIP archive, as known either from the central directory
/// (seekable mode) or a local header (streaming mode, updated in place
/// once a length-at-end member is finalised).
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub compression: u16,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
}

impl ZipEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_length_at_end(&self) -> bool {
        self.flags & FLAG_LENGTH_AT_END != 0
    }
}

enum Mode {
    Seekable {
        entries: Vec<ZipEntry>,
        next_index: Cell<usize>,
    },
    Streaming {
        exhausted: Cell<bool>,
    },
}

struct KnownEntry {
    entry: ZipEntry,
    data_offset: u64,
    position: u64,
}

/// State for a streaming-mode member whose sizes are not known until a
/// trailing data descriptor is found and CRC-validated (spec.md §4.2).
struct PendingEntry {
    entry: ZipEntry,
    data_offset: u64,
    position: u64,
    /// `pending[0..confirmed_len]` is data that has been validated as not
    /// part of the descriptor and is safe to hand to the caller.
    confirmed_len: usize,
    pending: VecDeque<u8>,
    next_read_offset: u64,
    crc: Crc32,
    finalized: bool,
    has_zip64_sizes: bool,
}

enum OpenEntry {
    Known(KnownEntry),
    LengthAtEnd(PendingEntry),
}

pub struct ZipReader {
    backing: SharedStorage,
    mode: Mode,
    current: RefCell<Option<OpenEntry>>,
}

impl ZipReader {
    /// Opens a ZIP archive over `backing`, using central-directory parsing
    /// when the storage can seek backward and falling back to sequential
    /// streaming mode otherwise.
    pub fn open(backing: SharedStorage) -> Result<Self, TensorReaderError> {
        if backing.can_seek_back(true) {
            let entries = read_central_directory(backing.as_ref())?;
            Ok(Self {
                backing,
                mode: Mode::Seekable {
                    entries,
                    next_index: Cell::new(0),
                },
                current: RefCell::new(None),
            })
        } else {
            Ok(Self {
                backing,
                mode: Mode::Streaming {
                    exhausted: Cell::new(false),
                },
                current: RefCell::new(None),
            })
        }
    }

    /// Advances to the next member. Returns `false` once the archive is
    /// exhausted.
    pub fn read_next_file(&self) -> Result<bool, TensorReaderError> {
        match &self.mode {
            Mode::Seekable {
                entries,
                next_index,
            } => {
                let idx = next_index.get();
                if idx >= entries.len() {
                    *self.current.borrow_mut() = None;
                    return Ok(false);
                }
                let entry = entries[idx].clone();
                next_index.set(idx + 1);
                self.open_known_entry(entry)?;
                Ok(true)
            }
            Mode::Streaming { exhausted } => {
                if exhausted.get() {
                    return Ok(false);
                }
                if let Some(prev) = self.current.borrow_mut().take() {
                    finish_entry(self.backing.as_ref(), prev)?;
                }

                let sig_bytes = self.backing.read(
                    4,
                    ReadFlags::PEEK | ReadFlags::ALLOW_PARTIAL | ReadFlags::ALLOW_EMPTY,
                )?;
                if sig_bytes.len() < 4 || le_u32(&sig_bytes)? != LOCAL_FILE_HEADER_SIGNATURE {
                    exhausted.set(true);
                    *self.current.borrow_mut() = None;
                    return Ok(false);
                }

                let local_header_offset = self.backing.current_position();
                let local = parse_local_header(self.backing.as_ref())?;
                if local.flags & FLAG_ENCRYPTED != 0 {
                    return Err(TensorReaderError::Zip(format!(
                        "{}: encrypted members are not supported",
                        local.name
                    )));
                }
                if local.compression != 0 {
                    return Err(TensorReaderError::Zip(format!(
                        "{}: unsupported compression method {}",
                        local.name, local.compression
                    )));
                }
                let data_offset = self.backing.current_position();
                let entry = ZipEntry {
                    name: local.name,
                    compression: local.compression,
                    flags: local.flags,
                    crc32: 0,
                    compressed_size: local.compressed_size,
                    uncompressed_size: local.uncompressed_size,
                    local_header_offset,
                };

                *self.current.borrow_mut() = Some(if entry.is_length_at_end() {
                    OpenEntry::LengthAtEnd(PendingEntry {
                        entry,
                        data_offset,
                        position: 0,
                        confirmed_len: 0,
                        pending: VecDeque::new(),
                        next_read_offset: data_offset,
                        crc: Crc32::new(),
                        finalized: false,
                        has_zip64_sizes: local.has_zip64_extra,
                    })
                } else {
                    OpenEntry::Known(KnownEntry {
                        entry,
                        data_offset,
                        position: 0,
                    })
                });
                Ok(true)
            }
        }
    }

    pub fn current_entry(&self) -> Option<ZipEntry> {
        self.current.borrow().as_ref().map(|e| match e {
            OpenEntry::Known(k) => k.entry.clone(),
            OpenEntry::LengthAtEnd(p) => p.entry.clone(),
        })
    }

    /// Absolute offset of the current member's data within `backing`,
    /// valid once its size is known (always true in seekable mode, and
    /// in streaming mode once a length-at-end member is finalized).
    pub fn current_data_offset(&self) -> Option<u64> {
        self.current.borrow().as_ref().map(|e| match e {
            OpenEntry::Known(k) => k.data_offset,
            OpenEntry::LengthAtEnd(p) => p.data_offset,
        })
    }

    /// The backing storage this archive reads from, for callers (the
    /// PyTorch tensor reader) that need a region-scoped view directly
    /// over a STORE-compressed member's raw bytes.
    pub fn backing(&self) -> &SharedStorage {
        &self.backing
    }

    /// Consumes the rest of the current member. In streaming mode with a
    /// length-at-end member this drives the descriptor scan to completion.
    pub fn seek_to_end(&self) -> Result<(), StorageError> {
        let mut cur = self.current.borrow_mut();
        match cur.as_mut() {
            None => Ok(()),
            Some(OpenEntry::Known(k)) => {
                let abs = k.data_offset + k.entry.uncompressed_size;
                if self.backing.current_position() != abs {
                    self.backing.seek_to(abs)?;
                }
                k.position = k.entry.uncompressed_size;
                Ok(())
            }
            Some(OpenEntry::LengthAtEnd(p)) => {
                if !p.finalized {
                    ensure_confirmed(self.backing.as_ref(), p, usize::MAX)?;
                }
                p.pending.clear();
                p.confirmed_len = 0;
                p.position = p.entry.uncompressed_size;
                Ok(())
            }
        }
    }

    fn open_known_entry(&self, entry: ZipEntry) -> Result<(), TensorReaderError> {
        if entry.is_encrypted() {
            return Err(TensorReaderError::Zip(format!(
                "{}: encrypted members are not supported",
                entry.name
            )));
        }
        if entry.compression != 0 {
            return Err(TensorReaderError::Zip(format!(
                "{}: unsupported compression method {}",
                entry.name, entry.compression
            )));
        }
        self.backing.seek_to(entry.local_header_offset)?;
        let local = parse_local_header(self.backing.as_ref())?;
        if !entry.is_length_at_end()
            && (local.compressed_size != entry.compressed_size
                || local.uncompressed_size != entry.uncompressed_size)
        {
            return Err(TensorReaderError::Zip(format!(
                "{}: local header sizes disagree with the central directory",
                entry.name
            )));
        }
        let data_offset = self.backing.current_position();
        *self.current.borrow_mut() = Some(OpenEntry::Known(KnownEntry {
            entry,
            data_offset,
            position: 0,
        }));
        Ok(())
    }
}

impl Storage for ZipReader {
    fn current_position(&self) -> u64 {
        match self.current.borrow().as_ref() {
            Some(OpenEntry::Known(k)) => k.position,
            Some(OpenEntry::LengthAtEnd(p)) => p.position,
            None => 0,
        }
    }

    fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
        let mut cur = self.current.borrow_mut();
        match cur.as_mut() {
            None if length == 0 || flags.contains(ReadFlags::ALLOW_EMPTY) => {
                Ok(ReadBuf::Owned(Vec::new()))
            }
            None => Err(StorageError::EndOfStream {
                requested: length,
                available: 0,
            }),
            Some(OpenEntry::Known(k)) => read_known(self.backing.as_ref(), k, length, flags),
            Some(OpenEntry::LengthAtEnd(p)) => {
                read_length_at_end(self.backing.as_ref(), p, length, flags)
            }
        }
    }

    fn can_seek_back(&self, _allow_detect: bool) -> bool {
        false
    }

    fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
        let cur_pos = self.current_position();
        if absolute < cur_pos {
            return Err(StorageError::BackwardSeekUnsupported);
        }
        if absolute == cur_pos {
            return Ok(());
        }
        let _ = self.read(
            absolute - cur_pos,
            ReadFlags::ALLOW_PARTIAL | ReadFlags::ALLOW_EMPTY,
        )?;
        Ok(())
    }

    fn seek_from_back(&self, _absolute_from_end: u64) -> Result<(), StorageError> {
        Err(StorageError::BackwardSeekUnsupported)
    }

    fn len_hint(&self) -> Option<u64> {
        match self.current.borrow().as_ref() {
            Some(OpenEntry::Known(k)) => Some(k.entry.uncompressed_size),
            Some(OpenEntry::LengthAtEnd(p)) if p.finalized => Some(p.entry.uncompressed_size),
            _ => None,
        }
    }
}

fn finish_entry(backing: &dyn Storage, entry: OpenEntry) -> Result<(), TensorReaderError> {
    match entry {
        OpenEntry::Known(k) => {
            let abs = k.data_offset + k.entry.uncompressed_size;
            if backing.current_position() != abs {
                backing.seek_to(abs)?;
            }
        }
        OpenEntry::LengthAtEnd(mut p) => {
            if !p.finalized {
                ensure_confirmed(backing, &mut p, usize::MAX)?;
            }
        }
    }
    Ok(())
}

fn read_known(
    backing: &dyn Storage,
    k: &mut KnownEntry,
    length: u64,
    flags: ReadFlags,
) -> Result<ReadBuf<'static>, StorageError> {
    let remaining = k.entry.uncompressed_size.saturating_sub(k.position);
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

    let abs = k.data_offset + k.position;
    if backing.current_position() != abs {
        backing.seek_to(abs)?;
    }
    let data = backing.read(take, flags)?.into_owned();
    if !flags.contains(ReadFlags::PEEK) {
        k.position += take;
    }
    Ok(ReadBuf::Owned(data))
}

fn read_length_at_end(
    backing: &dyn Storage,
    p: &mut PendingEntry,
    length: u64,
    flags: ReadFlags,
) -> Result<ReadBuf<'static>, StorageError> {
    let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
    let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);
    let peek = flags.contains(ReadFlags::PEEK);

    ensure_confirmed(backing, p, length as usize)?;

    let available = p.confirmed_len as u64;
    if available == 0 && length > 0 {
        if !allow_empty {
            return Err(StorageError::EndOfStream {
                requested: length,
                available: 0,
            });
        }
    } else if available < length && !allow_partial {
        return Err(StorageError::EndOfStream {
            requested: length,
            available,
        });
    }
    let take = length.min(available) as usize;

    if peek {
        Ok(ReadBuf::Owned(p.pending.iter().take(take).copied().collect()))
    } else {
        let data: Vec<u8> = p.pending.drain(..take).collect();
        p.confirmed_len -= take;
        p.position += take as u64;
        Ok(ReadBuf::Owned(data))
    }
}

/// Grows `p.confirmed_len` to at least `want` bytes (or until the member is
/// finalized) by buffering raw bytes from `backing` and scanning them for a
/// CRC32-validated data-descriptor, per spec.md §4.2's streaming-mode
/// recovery algorithm.
fn ensure_confirmed(
    backing: &dyn Storage,
    p: &mut PendingEntry,
    want: usize,
) -> Result<(), StorageError> {
    let descriptor_len = 8 + if p.has_zip64_sizes { 16 } else { 8 };
    loop {
        if p.finalized || p.confirmed_len >= want {
            return Ok(());
        }

        let min_window = p.confirmed_len + 256.max(4);
        fill_to(backing, p, min_window)?;

        let scan_limit = p.pending.len().saturating_sub(4);
        if p.pending.len() < p.confirmed_len + 4 {
            return Err(StorageError::EndOfStream {
                requested: want as u64,
                available: p.confirmed_len as u64,
            });
        }

        let mut found = None;
        for i in p.confirmed_len..=scan_limit {
            if p.pending[i] == 0x50
                && p.pending[i + 1] == 0x4b
                && p.pending[i + 2] == 0x07
                && p.pending[i + 3] == 0x08
            {
                found = Some(i);
                break;
            }
        }

        let Some(idx) = found else {
            let safe = p.pending.len().saturating_sub(3).max(p.confirmed_len);
            if safe > p.confirmed_len {
                let tail: Vec<u8> = p
                    .pending
                    .iter()
                    .skip(p.confirmed_len)
                    .take(safe - p.confirmed_len)
                    .copied()
                    .collect();
                p.crc.update(&tail);
                p.confirmed_len = safe;
                continue;
            }
            return Err(StorageError::EndOfStream {
                requested: want as u64,
                available: p.confirmed_len as u64,
            });
        };

        fill_to(backing, p, idx + descriptor_len)?;
        if p.pending.len() < idx + descriptor_len {
            return Err(StorageError::EndOfStream {
                requested: want as u64,
                available: p.confirmed_len as u64,
            });
        }

        let tail: Vec<u8> = p
            .pending
            .iter()
            .skip(p.confirmed_len)
            .take(idx - p.confirmed_len)
            .copied()
            .collect();
        let mut candidate = p.crc.clone();
        candidate.update(&tail);
        let crc_bytes: Vec<u8> = p.pending.iter().skip(idx + 4).take(4).copied().collect();
        let candidate_crc = le_u32(&crc_bytes)?;

        if candidate.finalize() == candidate_crc {
            let size_len = if p.has_zip64_sizes { 8 } else { 4 };
            let csize_bytes: Vec<u8> = p
                .pending
                .iter()
                .skip(idx + 8)
                .take(size_len)
                .copied()
                .collect();
            let usize_bytes: Vec<u8> = p
                .pending
                .iter()
                .skip(idx + 8 + size_len)
                .take(size_len)
                .copied()
                .collect();
            let (csize, usize_) = if p.has_zip64_sizes {
                (le_u64(&csize_bytes)?, le_u64(&usize_bytes)?)
            } else {
                (le_u32(&csize_bytes)? as u64, le_u32(&usize_bytes)? as u64)
            };
            p.crc = candidate;
            p.confirmed_len = idx;
            p.pending.drain(idx..idx + descriptor_len);
            p.entry.crc32 = candidate_crc;
            p.entry.compressed_size = csize;
            p.entry.uncompressed_size = usize_;
            p.finalized = true;
            tracing::debug!(
                member = %p.entry.name,
                size = usize_,
                "recovered zip streaming-mode data descriptor"
            );
        } else {
            let byte = p.pending[p.confirmed_len];
            p.crc.update(&[byte]);
            p.confirmed_len += 1;
        }
    }
}

fn fill_to(backing: &dyn Storage, p: &mut PendingEntry, target_len: usize) -> Result<(), StorageError> {
    while p.pending.len() < target_len {
        let want_more = (target_len - p.pending.len()) as u64;
        if backing.current_position() != p.next_read_offset {
            backing.seek_to(p.next_read_offset)?;
        }
        let chunk = backing.read(want_more, ReadFlags::ALLOW_PARTIAL | ReadFlags::ALLOW_EMPTY)?;
        if chunk.is_empty() {
            break;
        }
        p.next_read_offset += chunk.len() as u64;
        p.pending.extend(chunk.as_slice().iter().copied());
    }
    Ok(())
}

struct EocdRecord {
    cd_offset: u64,
    entries_total: u64,
}

fn find_eocd(backing: &dyn Storage) -> Result<EocdRecord, TensorReaderError> {
    let total = backing
        .len_hint()
        .ok_or_else(|| TensorReaderError::Zip("zip storage has unknown length".into()))?;
    if total < 22 {
        return Err(TensorReaderError::Zip(
            "storage too small to hold a zip end-of-central-directory record".into(),
        ));
    }
    let scan_len = (22u64 + 65535).min(total);
    backing.seek_from_back(scan_len)?;
    let tail = backing.read(scan_len, ReadFlags::NONE)?.into_owned();

    let max_start = tail.len().saturating_sub(22);
    let mut offset_in_tail = None;
    for i in (0..=max_start).rev() {
        if tail.len() >= i + 4 && le_u32(&tail[i..i + 4]).unwrap_or(0) == EOCD_SIGNATURE {
            offset_in_tail = Some(i);
            break;
        }
    }
    let i = offset_in_tail.ok_or_else(|| {
        TensorReaderError::Zip("end of central directory record not found".into())
    })?;
    let eocd_offset = (total - scan_len) + i as u64;

    let rec = &tail[i..];
    let entries_total32 = le_u16(&rec[10..])? as u64;
    let cd_offset32 = le_u32(&rec[16..])? as u64;

    if eocd_offset >= 20 {
        backing.seek_to(eocd_offset - 20)?;
        let loc = backing.read(20, ReadFlags::ALLOW_PARTIAL)?.into_owned();
        if loc.len() == 20 && le_u32(&loc)? == EOCD64_LOCATOR_SIGNATURE {
            let eocd64_offset = le_u64(&loc[8..])?;
            backing.seek_to(eocd64_offset)?;
            let fixed = backing.read(56, ReadFlags::NONE)?.into_owned();
            if le_u32(&fixed)? == EOCD64_SIGNATURE {
                return Ok(EocdRecord {
                    cd_offset: le_u64(&fixed[48..])?,
                    entries_total: le_u64(&fixed[32..])?,
                });
            }
        }
    }

    Ok(EocdRecord {
        cd_offset: cd_offset32,
        entries_total: entries_total32,
    })
}

fn read_central_directory(backing: &dyn Storage) -> Result<Vec<ZipEntry>, TensorReaderError> {
    let eocd = find_eocd(backing)?;
    backing.seek_to(eocd.cd_offset)?;
    let mut entries = Vec::with_capacity(eocd.entries_total as usize);
    for _ in 0..eocd.entries_total {
        entries.push(parse_central_entry(backing)?);
    }
    Ok(entries)
}

fn parse_central_entry(backing: &dyn Storage) -> Result<ZipEntry, TensorReaderError> {
    let fixed = read_exact(backing, 46)?.into_owned();
    if le_u32(&fixed)? != CENTRAL_FILE_HEADER_SIGNATURE {
        return Err(TensorReaderError::Zip(
            "central directory file header signature mismatch".into(),
        ));
    }
    let flags = le_u16(&fixed[8..])?;
    let compression = le_u16(&fixed[10..])?;
    let crc32 = le_u32(&fixed[16..])?;
    let mut compressed_size = le_u32(&fixed[20..])? as u64;
    let mut uncompressed_size = le_u32(&fixed[24..])? as u64;
    let name_len = le_u16(&fixed[28..])? as u64;
    let extra_len = le_u16(&fixed[30..])? as u64;
    let comment_len = le_u16(&fixed[32..])? as u64;
    let mut local_header_offset = le_u32(&fixed[42..])? as u64;

    let name_bytes = read_exact(backing, name_len)?.into_owned();
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    let extra = read_exact(backing, extra_len)?.into_owned();
    let _comment = read_exact(backing, comment_len)?.into_owned();

    let (z_usize, z_csize, z_offset, _z_disk) = parse_zip64_extra(
        &extra,
        uncompressed_size == u32::MAX as u64,
        compressed_size == u32::MAX as u64,
        local_header_offset == u32::MAX as u64,
        false,
    );
    if let Some(v) = z_usize {
        uncompressed_size = v;
    }
    if let Some(v) = z_csize {
        compressed_size = v;
    }
    if let Some(v) = z_offset {
        local_header_offset = v;
    }

    Ok(ZipEntry {
        name,
        compression,
        flags,
        crc32,
        compressed_size,
        uncompressed_size,
        local_header_offset,
    })
}

struct LocalHeader {
    name: String,
    flags: u16,
    compression: u16,
    compressed_size: u64,
    uncompressed_size: u64,
    has_zip64_extra: bool,
}

fn parse_local_header(backing: &dyn Storage) -> Result<LocalHeader, TensorReaderError> {
    let fixed = read_exact(backing, 30)?.into_owned();
    if le_u32(&fixed)? != LOCAL_FILE_HEADER_SIGNATURE {
        return Err(TensorReaderError::Zip(
            "local file header signature mismatch".into(),
        ));
    }
    let flags = le_u16(&fixed[6..])?;
    let compression = le_u16(&fixed[8..])?;
    let mut compressed_size = le_u32(&fixed[18..])? as u64;
    let mut uncompressed_size = le_u32(&fixed[22..])? as u64;
    let name_len = le_u16(&fixed[26..])? as u64;
    let extra_len = le_u16(&fixed[28..])? as u64;

    let name_bytes = read_exact(backing, name_len)?.into_owned();
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    let extra = read_exact(backing, extra_len)?.into_owned();

    let (z_usize, z_csize, _, _) = parse_zip64_extra(
        &extra,
        uncompressed_size == u32::MAX as u64,
        compressed_size == u32::MAX as u64,
        false,
        false,
    );
    let has_zip64_extra = z_usize.is_some() || z_csize.is_some() || has_zip64_extra_id(&extra);
    if let Some(v) = z_usize {
        uncompressed_size = v;
    }
    if let Some(v) = z_csize {
        compressed_size = v;
    }

    Ok(LocalHeader {
        name,
        flags,
        compression,
        compressed_size,
        uncompressed_size,
        has_zip64_extra,
    })
}

fn has_zip64_extra_id(extra: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 <= extra.len() {
        let id = le_u16(&extra[i..]).unwrap_or(0);
        let size = le_u16(&extra[i + 2..]).unwrap_or(0) as usize;
        if id == ZIP64_EXTRA_ID {
            return true;
        }
        i += 4 + size;
    }
    false
}

/// Extracts whichever fields were flagged as sentinel (`0xFFFFFFFF`/
/// `0xFFFF`) from a ZIP64 extended-information extra field. Fields are
/// present only in the order uncompressed/compressed/local-offset/disk,
/// and only for the ones the caller indicates were sentinel values.
fn parse_zip64_extra(
    extra: &[u8],
    need_usize: bool,
    need_csize: bool,
    need_offset: bool,
    need_disk: bool,
) -> (Option<u64>, Option<u64>, Option<u64>, Option<u32>) {
    let mut i = 0;
    while i + 4 <= extra.len() {
        let id = le_u16(&extra[i..]).unwrap_or(0);
        let size = le_u16(&extra[i + 2..]).unwrap_or(0) as usize;
        let data_start = i + 4;
        let data_end = data_start + size;
        if id == ZIP64_EXTRA_ID && data_end <= extra.len() {
            let data = &extra[data_start..data_end];
            let mut off = 0;
            let mut usize_v = None;
            let mut csize_v = None;
            let mut offset_v = None;
            let mut disk_v = None;
            if need_usize && off + 8 <= data.len() {
                usize_v = le_u64(&data[off..]).ok();
                off += 8;
            }
            if need_csize && off + 8 <= data.len() {
                csize_v = le_u64(&data[off..]).ok();
                off += 8;
            }
            if need_offset && off + 8 <= data.len() {
                offset_v = le_u64(&data[off..]).ok();
                off += 8;
            }
            if need_disk && off + 4 <= data.len() {
                disk_v = le_u32(&data[off..]).ok();
            }
            return (usize_v, csize_v, offset_v, disk_v);
        }
        i = data_end;
    }
    (None, None, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::rc::Rc;

    fn local_header(name: &str, data: &[u8], flags: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // compression: stored
        out.extend_from_slice(&0u16.to_le_bytes()); // mod time
        out.extend_from_slice(&0u16.to_le_bytes()); // mod date
        let crc = {
            let mut c = Crc32::new();
            c.update(data);
            c.finalize()
        };
        let (crc_field, csize_field, usize_field) = if flags & FLAG_LENGTH_AT_END != 0 {
            (0u32, 0u32, 0u32)
        } else {
            (crc, data.len() as u32, data.len() as u32)
        };
        out.extend_from_slice(&crc_field.to_le_bytes());
        out.extend_from_slice(&csize_field.to_le_bytes());
        out.extend_from_slice(&usize_field.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // extra len
        out.extend_from_slice(name.as_bytes());
        out
    }

    fn build_seekable_zip(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut local_offsets = Vec::new();
        for (name, data) in members {
            local_offsets.push(out.len() as u32);
            out.extend_from_slice(&local_header(name, data, 0));
            out.extend_from_slice(data);
        }
        let cd_start = out.len() as u32;
        for ((name, data), &local_offset) in members.iter().zip(&local_offsets) {
            let crc = {
                let mut c = Crc32::new();
                c.update(data);
                c.finalize()
            };
            out.extend_from_slice(&CENTRAL_FILE_HEADER_SIGNATURE.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes()); // version made by
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(&0u16.to_le_bytes()); // compression
            out.extend_from_slice(&0u16.to_le_bytes()); // mod time
            out.extend_from_slice(&0u16.to_le_bytes()); // mod date
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // extra len
            out.extend_from_slice(&0u16.to_le_bytes()); // comment len
            out.extend_from_slice(&0u16.to_le_bytes()); // disk number
            out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            out.extend_from_slice(&local_offset.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        let cd_size = out.len() as u32 - cd_start;
        out.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(members.len() as u16).to_le_bytes());
        out.extend_from_slice(&(members.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_start.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment len
        out
    }

    #[test]
    fn seekable_round_trip_reads_members_in_order() {
        let bytes = build_seekable_zip(&[("a.bin", b"hello"), ("b.bin", b"world!!")]);
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        let reader = ZipReader::open(backing).unwrap();

        assert!(reader.read_next_file().unwrap());
        assert_eq!(reader.current_entry().unwrap().name, "a.bin");
        assert_eq!(reader.read(5, ReadFlags::NONE).unwrap().as_slice(), b"hello");

        assert!(reader.read_next_file().unwrap());
        assert_eq!(reader.current_entry().unwrap().name, "b.bin");
        assert_eq!(reader.current_position(), 0);
        assert_eq!(
            reader.read(7, ReadFlags::NONE).unwrap().as_slice(),
            b"world!!"
        );

        assert!(!reader.read_next_file().unwrap());
    }

    #[test]
    fn rejects_deflate_compressed_member() {
        let mut bytes = build_seekable_zip(&[("a.bin", b"hello")]);
        // Flip the central directory entry's compression method to deflate (8).
        let cd_compression_offset = bytes.len() - 22 /* eocd */ - (46 + "a.bin".len()) /* one cd entry */ + 10;
        bytes[cd_compression_offset] = 8;
        let backing: SharedStorage = Rc::new(MemoryStorage::new(bytes));
        let reader = ZipReader::open(backing).unwrap();
        assert!(reader.read_next_file().is_err());
    }

    struct ForwardOnly(std::cell::RefCell<std::io::Cursor<Vec<u8>>>);

    impl Storage for ForwardOnly {
        fn current_position(&self) -> u64 {
            self.0.borrow().position()
        }
        fn read(&self, length: u64, flags: ReadFlags) -> Result<ReadBuf<'_>, StorageError> {
            use std::io::Read;
            let mut cur = self.0.borrow_mut();
            let avail = cur.get_ref().len() as u64 - cur.position();
            let allow_partial = flags.contains(ReadFlags::ALLOW_PARTIAL);
            let allow_empty = flags.contains(ReadFlags::ALLOW_EMPTY);
            if avail == 0 && length > 0 && !allow_empty {
                return Err(StorageError::EndOfStream {
                    requested: length,
                    available: 0,
                });
            }
            if avail < length && !allow_partial && avail != 0 {
                return Err(StorageError::EndOfStream {
                    requested: length,
                    available: avail,
                });
            }
            let take = length.min(avail);
            let start = cur.position() as usize;
            let mut buf = vec![0u8; take as usize];
            if !flags.contains(ReadFlags::PEEK) {
                cur.read_exact(&mut buf).unwrap();
            } else {
                buf.copy_from_slice(&cur.get_ref()[start..start + take as usize]);
            }
            Ok(ReadBuf::Owned(buf))
        }
        fn can_seek_back(&self, _allow_detect: bool) -> bool {
            false
        }
        fn seek_to(&self, absolute: u64) -> Result<(), StorageError> {
            let cur = self.current_position();
            if absolute < cur {
                return Err(StorageError::BackwardSeekUnsupported);
            }
            let _ = self.read(absolute - cur, ReadFlags::ALLOW_PARTIAL | ReadFlags::ALLOW_EMPTY)?;
            Ok(())
        }
        fn seek_from_back(&self, _absolute_from_end: u64) -> Result<(), StorageError> {
            Err(StorageError::BackwardSeekUnsupported)
        }
    }

    #[test]
    fn streaming_mode_recovers_length_at_end_member_with_embedded_false_signature() {
        // Payload deliberately contains the raw bytes of the data-descriptor
        // signature in the middle, so the scanner must reject that false
        // candidate (CRC won't match) before finding the real descriptor.
        let payload = [
            b"abc".as_slice(),
            &[0x50, 0x4b, 0x07, 0x08],
            b"xyz".as_slice(),
        ]
        .concat();

        let mut bytes = local_header("m.bin", &payload, FLAG_LENGTH_AT_END);
        bytes.extend_from_slice(&payload);
        let crc = {
            let mut c = Crc32::new();
            c.update(&payload);
            c.finalize()
        };
        bytes.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        let backing: SharedStorage = Rc::new(ForwardOnly(std::cell::RefCell::new(
            std::io::Cursor::new(bytes),
        )));
        let reader = ZipReader::open(backing).unwrap();
        assert!(reader.read_next_file().unwrap());
        let entry = reader.current_entry().unwrap();
        assert!(entry.is_length_at_end());

        let got = reader
            .read(payload.len() as u64, ReadFlags::ALLOW_PARTIAL)
            .unwrap()
            .into_owned();
        assert_eq!(got, payload);
        let entry = reader.current_entry().unwrap();
        assert_eq!(entry.uncompressed_size, payload.len() as u64);
        assert_eq!(entry.crc32, crc);

        assert!(!reader.read_next_file().unwrap());
    }
}

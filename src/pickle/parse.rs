//! Opcode-at-a-time parsing driven by a `Storage`, per spec.md §4.3
//! ("Parsing reads one opcode byte at a time from a storage"). Grounded
//! on the teacher's `parsers.rs` opcode table and dispatch shape, but
//! reading through the `Storage` contract instead of `nom` over a flat
//! `&[u8]` slice, so a pickle stream embedded in a streaming ZIP member
//! or a gzip source parses without first buffering the whole thing.

use crate::error::{PickleError, StorageError};
use crate::pickle::ops::{byte, Op};
use crate::storage::{ReadFlags, Storage};
use crate::util::{le_f64, le_i32, le_u16, le_u32, le_u64};

fn read_exact(storage: &dyn Storage, len: u64) -> Result<Vec<u8>, StorageError> {
    Ok(storage.read(len, ReadFlags::NONE)?.into_owned())
}

fn read_byte(storage: &dyn Storage) -> Result<u8, StorageError> {
    Ok(read_exact(storage, 1)?[0])
}

fn read_u16(storage: &dyn Storage) -> Result<u16, StorageError> {
    le_u16(&read_exact(storage, 2)?)
}

fn read_u32(storage: &dyn Storage) -> Result<u32, StorageError> {
    le_u32(&read_exact(storage, 4)?)
}

fn read_u64(storage: &dyn Storage) -> Result<u64, StorageError> {
    le_u64(&read_exact(storage, 8)?)
}

fn read_i32(storage: &dyn Storage) -> Result<i32, StorageError> {
    le_i32(&read_exact(storage, 4)?)
}

fn read_f64(storage: &dyn Storage) -> Result<f64, StorageError> {
    le_f64(&read_exact(storage, 8)?)
}

/// Reads a length-prefixed byte string whose length is given by `len_of`.
fn read_counted(
    storage: &dyn Storage,
    len: u64,
) -> Result<Vec<u8>, StorageError> {
    read_exact(storage, len)
}

/// Reads bytes up to (and discarding) the next `\n`, the teacher's
/// `parse_string_nl`, but fetched one byte at a time through `Storage`
/// instead of scanned in a pre-buffered slice.
fn read_line(storage: &dyn Storage) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    loop {
        let b = read_byte(storage)?;
        if b == b'\n' {
            return Ok(out);
        }
        out.push(b);
    }
}

fn read_line_str(storage: &dyn Storage) -> Result<String, PickleError> {
    let raw = read_line(storage)?;
    String::from_utf8(raw).map_err(|e| PickleError::Malformed {
        what: "text opcode argument",
        detail: e.utf8_error().to_string(),
    })
}

/// Reads one opcode and its payload. An unknown opcode byte is always
/// an error, matching the teacher's `cut(context("Bad opcode", fail))`
/// fallback arm.
pub fn read_op(storage: &dyn Storage) -> Result<Op, PickleError> {
    let opcode = read_byte(storage)?;
    Ok(match opcode {
        byte::MARK => Op::Mark,
        byte::STOP => Op::Stop,
        byte::POP => Op::Pop,
        byte::POP_MARK => Op::PopMark,
        byte::DUP => Op::Dup,
        byte::FLOAT => Op::Float(read_line_str(storage)?),
        byte::INT => Op::Int(read_line_str(storage)?),
        byte::BININT => Op::BinInt(read_i32(storage)?),
        byte::BININT1 => Op::BinInt1(read_byte(storage)?),
        byte::LONG => Op::Long(read_line_str(storage)?),
        byte::BININT2 => Op::BinInt2(read_u16(storage)?),
        byte::NONE => Op::None,
        byte::PERSID => Op::PersId(read_line_str(storage)?),
        byte::BINPERSID => Op::BinPersId,
        byte::REDUCE => Op::Reduce,
        byte::STRING => Op::Str(read_line(storage)?),
        byte::BINSTRING => {
            let len = read_u32(storage)? as u64;
            Op::BinString(read_counted(storage, len)?)
        }
        byte::SHORT_BINSTRING => {
            let len = read_byte(storage)? as u64;
            Op::ShortBinString(read_counted(storage, len)?)
        }
        byte::UNICODE => Op::Unicode(read_line_str(storage)?),
        byte::BINUNICODE => {
            let len = read_u32(storage)? as u64;
            Op::BinUnicode(utf8(read_counted(storage, len)?)?)
        }
        byte::APPEND => Op::Append,
        byte::BUILD => Op::Build,
        byte::GLOBAL => Op::Global(read_line_str(storage)?, read_line_str(storage)?),
        byte::DICT => Op::Dict,
        byte::EMPTY_DICT => Op::EmptyDict,
        byte::APPENDS => Op::Appends,
        byte::GET => Op::Get(read_line_str(storage)?),
        byte::BINGET => Op::BinGet(read_byte(storage)?),
        byte::INST => Op::Inst(read_line_str(storage)?, read_line_str(storage)?),
        byte::LONG_BINGET => Op::LongBinGet(read_u32(storage)?),
        byte::LIST => Op::List,
        byte::EMPTY_LIST => Op::EmptyList,
        byte::OBJ => Op::Obj,
        byte::PUT => Op::Put(read_line_str(storage)?),
        byte::BINPUT => Op::BinPut(read_byte(storage)?),
        byte::LONG_BINPUT => Op::LongBinPut(read_u32(storage)?),
        byte::SETITEM => Op::SetItem,
        byte::TUPLE => Op::Tuple,
        byte::EMPTY_TUPLE => Op::EmptyTuple,
        byte::SETITEMS => Op::SetItems,
        byte::BINFLOAT => Op::BinFloat(read_f64(storage)?),
        byte::PROTO => Op::Proto(read_byte(storage)?),
        byte::NEWOBJ => Op::NewObj,
        byte::EXT1 => Op::Ext1(read_byte(storage)?),
        byte::EXT2 => Op::Ext2(read_u16(storage)? as i16),
        byte::EXT4 => Op::Ext4(read_i32(storage)?),
        byte::TUPLE1 => Op::Tuple1,
        byte::TUPLE2 => Op::Tuple2,
        byte::TUPLE3 => Op::Tuple3,
        byte::NEWTRUE => Op::NewTrue,
        byte::NEWFALSE => Op::NewFalse,
        byte::LONG1 => {
            let len = read_byte(storage)? as u64;
            Op::Long1(read_counted(storage, len)?)
        }
        byte::LONG4 => {
            let len = read_u32(storage)? as u64;
            Op::Long4(read_counted(storage, len)?)
        }
        byte::BINBYTES => {
            let len = read_u32(storage)? as u64;
            Op::BinBytes(read_counted(storage, len)?)
        }
        byte::SHORT_BINBYTES => {
            let len = read_byte(storage)? as u64;
            Op::ShortBinBytes(read_counted(storage, len)?)
        }
        byte::SHORT_BINUNICODE => {
            let len = read_byte(storage)? as u64;
            Op::ShortBinUnicode(utf8(read_counted(storage, len)?)?)
        }
        byte::BINUNICODE8 => {
            let len = read_u64(storage)?;
            Op::BinUnicode8(utf8(read_counted(storage, len)?)?)
        }
        byte::BINBYTES8 => {
            let len = read_u64(storage)?;
            Op::BinBytes8(read_counted(storage, len)?)
        }
        byte::EMPTY_SET => Op::EmptySet,
        byte::ADDITEMS => Op::AddItems,
        byte::FROZENSET => Op::FrozenSet,
        byte::NEWOBJ_EX => Op::NewObjEx,
        byte::STACK_GLOBAL => Op::StackGlobal,
        byte::MEMOIZE => Op::Memoize,
        byte::FRAME => Op::Frame(read_u64(storage)?),
        byte::BYTEARRAY8 => {
            let len = read_u64(storage)?;
            Op::ByteArray8(read_counted(storage, len)?)
        }
        byte::NEXT_BUFFER => Op::NextBuffer,
        byte::READONLY_BUFFER => Op::ReadonlyBuffer,
        other => return Err(PickleError::UnknownOpcode(other)),
    })
}

fn utf8(bytes: Vec<u8>) -> Result<String, PickleError> {
    String::from_utf8(bytes).map_err(|e| PickleError::Malformed {
        what: "utf8 string opcode argument",
        detail: e.utf8_error().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn storage(bytes: &[u8]) -> MemoryStorage {
        MemoryStorage::new(bytes.to_vec())
    }

    #[test]
    fn reads_proto_and_stop() {
        let s = storage(&[byte::PROTO, 2, byte::STOP]);
        assert_eq!(read_op(&s).unwrap(), Op::Proto(2));
        assert_eq!(read_op(&s).unwrap(), Op::Stop);
    }

    #[test]
    fn reads_binint_little_endian() {
        let s = storage(&[byte::BININT, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(read_op(&s).unwrap(), Op::BinInt(1));
    }

    #[test]
    fn reads_short_binunicode() {
        let mut bytes = vec![byte::SHORT_BINUNICODE, 5];
        bytes.extend_from_slice(b"hello");
        let s = storage(&bytes);
        assert_eq!(read_op(&s).unwrap(), Op::ShortBinUnicode("hello".to_string()));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let s = storage(&[0xEE]);
        assert!(matches!(read_op(&s), Err(PickleError::UnknownOpcode(0xEE))));
    }

    #[test]
    fn long1_reads_counted_payload() {
        let s = storage(&[byte::LONG1, 1, 0x80]);
        assert_eq!(read_op(&s).unwrap(), Op::Long1(vec![0x80]));
    }
}

//! The stack-machine evaluator (spec.md §4.3): three runtime
//! structures — an item stack, a stack of mark offsets, and a memo
//! table — rather than the teacher's `eval.rs`, which conflates marks
//! into the value stack itself as `Value::Raw(Cow::Borrowed(&MARK))`.
//! Keeping marks as a separate offset stack is what spec.md's data
//! model calls for, and it also makes `pop_mark` a plain `Vec::split_off`
//! instead of a linear scan back through the stack for a sentinel.

use std::collections::HashMap;
use std::rc::Rc;

use num_bigint::BigInt;

use crate::error::PickleError;
use crate::pickle::compat;
use crate::pickle::item::{Item, ItemRef, ItemType};
use crate::pickle::ops::Op;
use crate::pickle::parse::read_op;
use crate::storage::Storage;

/// How the legacy `S`/`T`/`U` string opcodes (spec.md §4.3) should be
/// interpreted, since pickle itself does not record whether their
/// payload was meant to be text or raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Utf8,
    Bytes,
}

pub struct Interpreter {
    stack: Vec<ItemRef>,
    marks: Vec<usize>,
    memo: HashMap<u32, ItemRef>,
    protocol: u8,
    encoding: StringEncoding,
}

impl Interpreter {
    pub fn new(encoding: StringEncoding) -> Self {
        Self {
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            protocol: 0,
            encoding,
        }
    }

    /// Runs the machine to `STOP`, returning the single remaining item.
    pub fn run(&mut self, storage: &dyn Storage) -> Result<ItemRef, PickleError> {
        loop {
            let op = read_op(storage)?;
            if op == Op::Stop {
                break;
            }
            self.apply(op)?;
        }
        if !self.marks.is_empty() {
            return Err(PickleError::UnterminatedMark);
        }
        if self.stack.len() != 1 {
            return Err(PickleError::BadFinalStack(self.stack.len()));
        }
        Ok(self.stack.pop().unwrap())
    }

    fn push(&mut self, item: ItemRef) {
        self.stack.push(item);
    }

    fn pop(&mut self) -> Result<ItemRef, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&self) -> Result<&ItemRef, PickleError> {
        self.stack.last().ok_or(PickleError::StackUnderflow)
    }

    fn pop_mark_items(&mut self) -> Result<Vec<ItemRef>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark)?;
        if mark > self.stack.len() {
            return Err(PickleError::MissingMark);
        }
        Ok(self.stack.split_off(mark))
    }

    fn memo_id(s: &str) -> Result<u32, PickleError> {
        s.trim().parse().map_err(|_| PickleError::Malformed {
            what: "memo index",
            detail: s.to_string(),
        })
    }

    fn apply(&mut self, op: Op) -> Result<(), PickleError> {
        match op {
            Op::Mark => self.marks.push(self.stack.len()),
            Op::Stop => unreachable!("STOP is handled in run()"),
            Op::Pop => {
                self.pop()?;
            }
            Op::PopMark => {
                self.pop_mark_items()?;
            }
            Op::Dup => {
                let top = Rc::clone(self.top()?);
                self.push(top);
            }
            Op::Float(s) => self.push(Item::leaf(ItemType::Float, s.into_bytes())),
            Op::Int(s) => self.push(match s.as_str() {
                "01" => Item::leaf(ItemType::Bool, vec![1]),
                "00" => Item::leaf(ItemType::Bool, vec![0]),
                _ => Item::leaf(ItemType::Int, s.into_bytes()),
            }),
            Op::BinInt(v) => self.push(Item::text(ItemType::Int, &v.to_string())),
            Op::BinInt1(v) => self.push(Item::text(ItemType::Int, &v.to_string())),
            Op::Long(s) => {
                let trimmed = s.strip_suffix(['L', 'l']).unwrap_or(&s);
                self.push(Item::text(ItemType::Int, trimmed));
            }
            Op::BinInt2(v) => self.push(Item::text(ItemType::Int, &v.to_string())),
            Op::None => self.push(Item::new(ItemType::None)),
            Op::PersId(s) => {
                let value = Item::text(ItemType::Str, &s);
                let item = Item::new(ItemType::PersId);
                item.borrow_mut().children.push(value);
                self.push(item);
            }
            Op::BinPersId => {
                let value = self.pop()?;
                let item = Item::new(ItemType::PersId);
                item.borrow_mut().children.push(value);
                self.push(item);
            }
            Op::Reduce => {
                let args = self.pop()?;
                let callable = self.pop()?;
                self.push(reduce(callable, args));
            }
            Op::Str(raw) => {
                let decoded = decode_py2_quoted(&raw)?;
                self.push(self.string_leaf(decoded)?);
            }
            Op::BinString(bytes) | Op::ShortBinString(bytes) => {
                self.push(self.string_leaf(bytes)?);
            }
            Op::Unicode(s) => {
                let decoded = decode_raw_unicode_escape(&s)?;
                self.push(Item::text(ItemType::Str, &decoded));
            }
            Op::BinUnicode(s) => self.push(Item::text(ItemType::Str, &s)),
            Op::Append => {
                let value = self.pop()?;
                let list = self.top()?;
                require_kind(list, ItemType::List, "APPEND")?;
                list.borrow_mut().children.push(value);
            }
            Op::Build => {
                let state = self.pop()?;
                let obj = self.top()?;
                obj.borrow_mut().build_state = Some(state);
            }
            Op::Global(module, name) => self.push(self.global_item(&module, &name)),
            Op::Dict => {
                let items = self.pop_mark_items()?;
                self.push(dict_from_flat(items)?);
            }
            Op::EmptyDict => self.push(Item::new(ItemType::Dict)),
            Op::Appends => {
                let items = self.pop_mark_items()?;
                let list = self.top()?;
                require_kind(list, ItemType::List, "APPENDS")?;
                list.borrow_mut().children.extend(items);
            }
            Op::Get(s) => {
                let id = Self::memo_id(&s)?;
                self.push(self.memo_get(id)?);
            }
            Op::BinGet(v) => self.push(self.memo_get(v as u32)?),
            Op::Inst(module, name) => {
                let args = self.pop_mark_items()?;
                let global = self.global_item(&module, &name);
                let obj = Item::new(ItemType::Obj);
                {
                    let mut o = obj.borrow_mut();
                    o.children.push(global);
                    o.children.extend(args);
                }
                self.push(obj);
            }
            Op::LongBinGet(v) => self.push(self.memo_get(v)?),
            Op::List => {
                let items = self.pop_mark_items()?;
                let item = Item::new(ItemType::List);
                item.borrow_mut().children = items;
                self.push(item);
            }
            Op::EmptyList => self.push(Item::new(ItemType::List)),
            Op::Obj => {
                let mut items = self.pop_mark_items()?;
                if items.is_empty() {
                    return Err(PickleError::Malformed {
                        what: "OBJ",
                        detail: "no class argument on the stack".to_string(),
                    });
                }
                let class = items.remove(0);
                let obj = Item::new(ItemType::Obj);
                {
                    let mut o = obj.borrow_mut();
                    o.children.push(class);
                    o.children.extend(items);
                }
                self.push(obj);
            }
            Op::Put(s) => {
                let id = Self::memo_id(&s)?;
                let top = Rc::clone(self.top()?);
                self.memo.insert(id, top);
            }
            Op::BinPut(v) => {
                let top = Rc::clone(self.top()?);
                self.memo.insert(v as u32, top);
            }
            Op::LongBinPut(v) => {
                let top = Rc::clone(self.top()?);
                self.memo.insert(v, top);
            }
            Op::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?;
                let target = self.top()?;
                target.borrow_mut().dict_children.push((key, value));
            }
            Op::Tuple => {
                let items = self.pop_mark_items()?;
                let item = Item::new(ItemType::Tuple);
                item.borrow_mut().children = items;
                self.push(item);
            }
            Op::EmptyTuple => self.push(Item::new(ItemType::Tuple)),
            Op::SetItems => {
                let items = self.pop_mark_items()?;
                let target = self.top()?;
                push_pairs(target, items)?;
            }
            Op::BinFloat(v) => self.push(Item::text(ItemType::Float, &v.to_string())),
            Op::Proto(v) => {
                if v > 5 {
                    return Err(PickleError::UnsupportedProtocol(v));
                }
                self.protocol = v;
            }
            Op::NewObj => {
                let args = self.pop()?;
                let class = self.pop()?;
                let obj = Item::new(ItemType::Obj);
                {
                    let mut o = obj.borrow_mut();
                    o.children.push(class);
                    o.children.extend(args.borrow().children.iter().cloned());
                }
                self.push(obj);
            }
            Op::Ext1(v) => self.push(Item::text(ItemType::Ext, &v.to_string())),
            Op::Ext2(v) => self.push(Item::text(ItemType::Ext, &v.to_string())),
            Op::Ext4(v) => self.push(Item::text(ItemType::Ext, &v.to_string())),
            Op::Tuple1 => {
                let a = self.pop()?;
                let item = Item::new(ItemType::Tuple);
                item.borrow_mut().children.push(a);
                self.push(item);
            }
            Op::Tuple2 => {
                let b = self.pop()?;
                let a = self.pop()?;
                let item = Item::new(ItemType::Tuple);
                item.borrow_mut().children.extend([a, b]);
                self.push(item);
            }
            Op::Tuple3 => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                let item = Item::new(ItemType::Tuple);
                item.borrow_mut().children.extend([a, b, c]);
                self.push(item);
            }
            Op::NewTrue => self.push(Item::leaf(ItemType::Bool, vec![1])),
            Op::NewFalse => self.push(Item::leaf(ItemType::Bool, vec![0])),
            Op::Long1(bytes) | Op::Long4(bytes) => {
                self.push(Item::text(ItemType::Int, &decode_long_bytes(&bytes).to_string()));
            }
            Op::BinBytes(bytes) | Op::ShortBinBytes(bytes) | Op::BinBytes8(bytes) => {
                self.push(Item::leaf(ItemType::Bytes, bytes));
            }
            Op::ShortBinUnicode(s) | Op::BinUnicode8(s) => {
                self.push(Item::text(ItemType::Str, &s));
            }
            Op::EmptySet => self.push(Item::new(ItemType::Set)),
            Op::AddItems => {
                let items = self.pop_mark_items()?;
                let set = self.top()?;
                require_kind(set, ItemType::Set, "ADDITEMS")?;
                set.borrow_mut().children.extend(items);
            }
            Op::FrozenSet => {
                let items = self.pop_mark_items()?;
                let item = Item::new(ItemType::FrozenSet);
                item.borrow_mut().children = items;
                self.push(item);
            }
            Op::NewObjEx => {
                let kwargs = self.pop()?;
                let args = self.pop()?;
                let class = self.pop()?;
                let obj = Item::new(ItemType::Obj);
                {
                    let mut o = obj.borrow_mut();
                    o.children.push(class);
                    o.children.extend(args.borrow().children.iter().cloned());
                    o.children.push(kwargs);
                }
                self.push(obj);
            }
            Op::StackGlobal => {
                let name = self.pop()?;
                let module = self.pop()?;
                let module = module.borrow().as_str().map(str::to_string).ok_or_else(|| {
                    PickleError::BadStackTop("STACK_GLOBAL module")
                })?;
                let name = name.borrow().as_str().map(str::to_string).ok_or_else(|| {
                    PickleError::BadStackTop("STACK_GLOBAL name")
                })?;
                self.push(self.global_item(&module, &name));
            }
            Op::Memoize => {
                let id = self.memo.len() as u32;
                let top = Rc::clone(self.top()?);
                self.memo.insert(id, top);
            }
            Op::Frame(_) => {}
            Op::ByteArray8(bytes) => self.push(Item::leaf(ItemType::ByteArray, bytes)),
            Op::NextBuffer => self.push(Item::new(ItemType::Buffer)),
            Op::ReadonlyBuffer => {
                let top = self.pop()?;
                let item = Item::new(ItemType::Buffer);
                item.borrow_mut().children.push(top);
                self.push(item);
            }
        }
        Ok(())
    }

    fn string_leaf(&self, bytes: Vec<u8>) -> Result<ItemRef, PickleError> {
        match self.encoding {
            StringEncoding::Bytes => Ok(Item::leaf(ItemType::Bytes, bytes)),
            StringEncoding::Utf8 => {
                let s = String::from_utf8(bytes).map_err(|e| PickleError::Malformed {
                    what: "legacy string opcode payload",
                    detail: e.utf8_error().to_string(),
                })?;
                Ok(Item::text(ItemType::Str, &s))
            }
        }
    }

    fn global_item(&self, module: &str, name: &str) -> ItemRef {
        let (module, name) = compat::rename(self.protocol, module, name);
        let item = Item::new(ItemType::Global);
        {
            let mut g = item.borrow_mut();
            g.children.push(Item::text(ItemType::Str, &module));
            g.children.push(Item::text(ItemType::Str, &name));
        }
        item
    }

    fn memo_get(&self, id: u32) -> Result<ItemRef, PickleError> {
        self.memo
            .get(&id)
            .map(Rc::clone)
            .ok_or(PickleError::MissingMemo(id))
    }
}

fn require_kind(item: &ItemRef, kind: ItemType, opcode: &'static str) -> Result<(), PickleError> {
    if item.borrow().kind == kind {
        Ok(())
    } else {
        Err(PickleError::BadStackTop(opcode))
    }
}

fn push_pairs(target: &ItemRef, items: Vec<ItemRef>) -> Result<(), PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Malformed {
            what: "SETITEMS",
            detail: "odd number of key/value items".to_string(),
        });
    }
    let mut t = target.borrow_mut();
    for pair in items.chunks(2) {
        t.dict_children.push((Rc::clone(&pair[0]), Rc::clone(&pair[1])));
    }
    Ok(())
}

fn dict_from_flat(items: Vec<ItemRef>) -> Result<ItemRef, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Malformed {
            what: "DICT",
            detail: "odd number of key/value items".to_string(),
        });
    }
    let dict = Item::new(ItemType::Dict);
    {
        let mut d = dict.borrow_mut();
        for pair in items.chunks(2) {
            d.dict_children.push((Rc::clone(&pair[0]), Rc::clone(&pair[1])));
        }
    }
    Ok(dict)
}

/// `copyreg._reconstructor(class, builtins.object, None)` is rewritten
/// to a plain `obj` item with that class global and no arguments
/// (spec.md §4.3's reduce canonicalisation); every other reduce is kept
/// as-is.
fn reduce(callable: ItemRef, args: ItemRef) -> ItemRef {
    let is_reconstructor = {
        let c = callable.borrow();
        c.kind == ItemType::Global
            && c.children.len() == 2
            && c.children[0].borrow().as_str() == Some("copyreg")
            && c.children[1].borrow().as_str() == Some("_reconstructor")
    };
    if is_reconstructor {
        let a = args.borrow();
        if a.kind == ItemType::Tuple && a.children.len() == 3 {
            let base_is_object = {
                let base = a.children[1].borrow();
                base.kind == ItemType::Global
                    && base.children.len() == 2
                    && base.children[0].borrow().as_str() == Some("builtins")
                    && base.children[1].borrow().as_str() == Some("object")
            };
            let state_is_none = a.children[2].borrow().kind == ItemType::None;
            if base_is_object && state_is_none {
                let class = Rc::clone(&a.children[0]);
                drop(a);
                let obj = Item::new(ItemType::Obj);
                obj.borrow_mut().children.push(class);
                return obj;
            }
        }
    }
    let item = Item::new(ItemType::Reduce);
    item.borrow_mut().children.extend([callable, args]);
    item
}

/// Decodes a `LONG1`/`LONG4` byte vector per spec.md §4.3: little-endian
/// two's complement, sign from the top bit of the highest-order byte
/// (`& 0x80`; the teacher's `value.rs::fix_value` checks `& 80` decimal,
/// which is a different and incorrect mask).
fn decode_long_bytes(bytes: &[u8]) -> BigInt {
    if bytes.is_empty() {
        return BigInt::from(0);
    }
    let is_negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut value = BigInt::from_bytes_le(num_bigint::Sign::Plus, bytes);
    if is_negative {
        value -= BigInt::from(1) << (bytes.len() * 8);
    }
    value
}

/// Unquotes and unescapes the payload of an old-style `STRING` (`S`)
/// opcode, which pickle writes as a Python `repr()` of the string:
/// a quoted body with backslash escapes.
fn decode_py2_quoted(raw: &[u8]) -> Result<Vec<u8>, PickleError> {
    let bad = |detail: &str| {
        PickleError::Malformed {
            what: "STRING opcode quoting",
            detail: detail.to_string(),
        }
    };
    if raw.len() < 2 {
        return Err(bad("payload shorter than an empty quoted string"));
    }
    let quote = raw[0];
    if quote != b'\'' && quote != b'"' {
        return Err(bad("payload does not start with a quote character"));
    }
    if raw[raw.len() - 1] != quote {
        return Err(bad("closing quote does not match opening quote"));
    }
    let body = &raw[1..raw.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] != b'\\' {
            out.push(body[i]);
            i += 1;
            continue;
        }
        let next = *body.get(i + 1).ok_or_else(|| bad("trailing backslash"))?;
        match next {
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'0' => out.push(0),
            b'x' => {
                let hex = body
                    .get(i + 2..i + 4)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .ok_or_else(|| bad("truncated \\x escape"))?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| bad("invalid \\x escape"))?;
                out.push(byte);
                i += 4;
                continue;
            }
            other => return Err(bad(&format!("unsupported escape \\{}", other as char))),
        }
        i += 2;
    }
    Ok(out)
}

/// Decodes Python's `raw-unicode-escape` encoding used by the old
/// `UNICODE` (`V`) opcode: only `\uXXXX`/`\UXXXXXXXX` are special, every
/// other backslash is literal.
fn decode_raw_unicode_escape(s: &str) -> Result<String, PickleError> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() && (chars[i + 1] == 'u' || chars[i + 1] == 'U')
        {
            let width = if chars[i + 1] == 'u' { 4 } else { 8 };
            if i + 2 + width > chars.len() {
                return Err(PickleError::Malformed {
                    what: "UNICODE opcode escape",
                    detail: "truncated \\u escape".to_string(),
                });
            }
            let hex: String = chars[i + 2..i + 2 + width].iter().collect();
            let code = u32::from_str_radix(&hex, 16).map_err(|_| PickleError::Malformed {
                what: "UNICODE opcode escape",
                detail: format!("invalid hex digits {hex:?}"),
            })?;
            let ch = char::from_u32(code).ok_or_else(|| PickleError::Malformed {
                what: "UNICODE opcode escape",
                detail: format!("codepoint {code:#x} is not a valid char"),
            })?;
            out.push(ch);
            i += 2 + width;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle::ops::byte;
    use crate::storage::memory::MemoryStorage;

    fn run_bytes(bytes: &[u8]) -> Result<ItemRef, PickleError> {
        let storage = MemoryStorage::new(bytes.to_vec());
        let mut interp = Interpreter::new(StringEncoding::Utf8);
        interp.run(&storage)
    }

    #[test]
    fn long1_zero_bytes_is_zero() {
        let bytes = [&[byte::PROTO, 2, byte::LONG1, 0][..], &[byte::STOP]].concat();
        let item = run_bytes(&bytes).unwrap();
        assert_eq!(item.borrow().as_decimal_i64(), Some(0));
    }

    #[test]
    fn long1_single_negative_byte() {
        let bytes = [&[byte::PROTO, 2, byte::LONG1, 1, 0x80][..], &[byte::STOP]].concat();
        let item = run_bytes(&bytes).unwrap();
        assert_eq!(item.borrow().as_decimal_i64(), Some(-128));
    }

    #[test]
    fn long1_nine_byte_big_positive() {
        let payload = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut bytes = vec![byte::PROTO, 2, byte::LONG1, 9];
        bytes.extend_from_slice(&payload);
        bytes.push(byte::STOP);
        let item = run_bytes(&bytes).unwrap();
        assert_eq!(
            item.borrow().as_str().map(str::to_string),
            Some("2361183241434822606847".to_string())
        );
    }

    #[test]
    fn protocol2_i64_max_via_long1() {
        // \x80\x02\x8a\x08\xff\xff\xff\xff\xff\xff\xff\x7f.
        let bytes: Vec<u8> = vec![
            0x80, 0x02, 0x8a, 0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f, b'.',
        ];
        let item = run_bytes(&bytes).unwrap();
        assert_eq!(item.borrow().as_decimal_i64(), Some(i64::MAX));
    }

    #[test]
    fn put_then_get_preserve_identity() {
        let bytes = vec![
            byte::PROTO,
            2,
            byte::EMPTY_LIST,
            byte::BINPUT,
            0,
            byte::BINGET,
            0,
            byte::TUPLE2,
            byte::STOP,
        ];
        let item = run_bytes(&bytes).unwrap();
        let item = item.borrow();
        assert_eq!(item.kind, ItemType::Tuple);
        assert!(Rc::ptr_eq(&item.children[0], &item.children[1]));
    }

    #[test]
    fn mark_based_dict_builds_pairs() {
        let mut bytes = vec![byte::PROTO, 2, byte::MARK];
        bytes.push(byte::SHORT_BINUNICODE);
        bytes.push(1);
        bytes.extend_from_slice(b"a");
        bytes.push(byte::BININT1);
        bytes.push(1);
        bytes.push(byte::DICT);
        bytes.push(byte::STOP);
        let item = run_bytes(&bytes).unwrap();
        let item = item.borrow();
        assert_eq!(item.kind, ItemType::Dict);
        assert_eq!(item.dict_children.len(), 1);
        assert_eq!(item.dict_children[0].0.borrow().as_str(), Some("a"));
    }

    #[test]
    fn unterminated_mark_is_an_error() {
        let bytes = vec![byte::PROTO, 2, byte::MARK, byte::STOP];
        assert!(matches!(run_bytes(&bytes), Err(PickleError::UnterminatedMark)));
    }

    #[test]
    fn reduce_canonicalises_copyreg_reconstructor() {
        let mut bytes = vec![byte::PROTO, 2];
        bytes.push(byte::GLOBAL);
        bytes.extend_from_slice(b"copyreg\n_reconstructor\n");
        bytes.push(byte::GLOBAL);
        bytes.extend_from_slice(b"mymod\nMyClass\n");
        bytes.push(byte::GLOBAL);
        bytes.extend_from_slice(b"builtins\nobject\n");
        bytes.push(byte::NONE);
        bytes.push(byte::TUPLE3);
        bytes.push(byte::REDUCE);
        bytes.push(byte::STOP);
        let item = run_bytes(&bytes).unwrap();
        let item = item.borrow();
        assert_eq!(item.kind, ItemType::Obj);
        assert_eq!(item.children.len(), 1);
        let class = item.children[0].borrow();
        assert_eq!(class.children[1].borrow().as_str(), Some("MyClass"));
    }
}

//! The decoded object tree (spec.md §3 "Pickle Item"). Shaped after the
//! teacher's `Value<'a>` enum in `value.rs`, but as a single tagged
//! struct rather than per-variant payload types, and owning its data
//! (no borrow from the pickle buffer) so that items placed in the memo
//! table can outlive the opcode that produced them and be mutated in
//! place by later opcodes (`APPEND`, `BUILD`) without re-parsing.
//!
//! Per spec.md §9 ("use an arena with indices" when the host language
//! forbids cycles through owned pointers) Rust's `Rc<RefCell<_>>` gives
//! us owned, shareable, mutable nodes directly, so no separate arena is
//! needed.

use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemType {
    #[default]
    Unknown,
    None,
    Int,
    Float,
    Bool,
    Bytes,
    ByteArray,
    Str,
    List,
    Tuple,
    Buffer,
    FrozenSet,
    Set,
    Dict,
    Global,
    Reduce,
    Obj,
    PersId,
    Ext,
}

pub type ItemRef = Rc<RefCell<Item>>;

/// A node in the decoded object tree.
#[derive(Debug, Default)]
pub struct Item {
    pub kind: ItemType,
    /// Bytes payload for leaves (`Bytes`, `ByteArray`, `Str`, `Buffer`)
    /// and stringified numerics (`Int`, `Float`, `Ext`).
    pub data: Vec<u8>,
    /// Ordered children: list/tuple/set elements, or
    /// `[module, name]` for `Global`, `[global, args]` for `Reduce`,
    /// `[class, ...args]` for `Obj`, `[value]` for `PersId`.
    pub children: Vec<ItemRef>,
    /// Ordered key/value pairs for `Dict`.
    pub dict_children: Vec<(ItemRef, ItemRef)>,
    /// Side slot populated by `BUILD`.
    pub build_state: Option<ItemRef>,
}

impl Item {
    pub fn new(kind: ItemType) -> ItemRef {
        Rc::new(RefCell::new(Item {
            kind,
            ..Default::default()
        }))
    }

    pub fn leaf(kind: ItemType, data: Vec<u8>) -> ItemRef {
        Rc::new(RefCell::new(Item {
            kind,
            data,
            ..Default::default()
        }))
    }

    pub fn text(kind: ItemType, text: &str) -> ItemRef {
        Self::leaf(kind, text.as_bytes().to_vec())
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Parses `data` as a decimal integer, for `Int`/`Ext`/`Long`-style
    /// items whose payload is stored as a stringified numeral.
    pub fn as_decimal_i64(&self) -> Option<i64> {
        self.as_str()?.parse().ok()
    }

    pub fn is_true_ish(&self) -> bool {
        match self.kind {
            ItemType::Bool => self.data == [1],
            ItemType::Int => self.as_decimal_i64().map(|n| n != 0).unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips_string_payload() {
        let item = Item::text(ItemType::Str, "hello");
        assert_eq!(item.borrow().as_str(), Some("hello"));
        assert_eq!(item.borrow().kind, ItemType::Str);
    }

    #[test]
    fn shared_item_mutation_is_visible_through_all_references() {
        let list = Item::new(ItemType::List);
        let alias = Rc::clone(&list);
        list.borrow_mut().children.push(Item::text(ItemType::Int, "1"));
        assert_eq!(alias.borrow().children.len(), 1);
    }
}

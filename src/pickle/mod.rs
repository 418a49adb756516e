//! A faithful stack-machine interpreter for Python's pickle protocols
//! 0-5 (spec.md §4.3), sufficient to reconstruct the object graph
//! PyTorch writes into `data.pkl`. Grounded on the teacher's
//! `ops.rs`/`parsers.rs`/`value.rs`/`eval.rs`, restructured around a
//! `Storage`-driven opcode reader and a three-structure stack machine
//! (item stack, mark-offset stack, memo table) instead of the teacher's
//! flat-slice `nom` parser and conflated mark/value stack.

pub mod compat;
pub mod interp;
pub mod item;
pub mod ops;
pub mod parse;

pub use interp::{Interpreter, StringEncoding};
pub use item::{Item, ItemRef, ItemType};

use crate::error::PickleError;
use crate::storage::Storage;

/// Runs the interpreter over `storage` to `STOP` and returns the
/// decoded tree's root item.
pub fn decode(storage: &dyn Storage, encoding: StringEncoding) -> Result<ItemRef, PickleError> {
    Interpreter::new(encoding).run(storage)
}

//! Python 2 -> 3 `(module, name)` rename table applied to `GLOBAL` /
//! `STACK_GLOBAL` / `INST` pairs when the pickle protocol is below 3
//! (spec.md §4.3). A representative subset of the renames
//! `pickle.py`'s `_Unpickler.find_class` applies via
//! `compat_pickle.NAME_MAPPING`/`IMPORT_MAPPING`, covering the
//! well-known standard-library reorganizations rather than the full
//! ~150-entry table (see DESIGN.md).
//!
//! Grounded on the teacher's use of `once_cell::sync::Lazy` for the
//! bignum bound statics in `value.rs::fix_value`; applied here to a
//! lookup table instead.

use once_cell::sync::Lazy;
use std::collections::HashMap;

static RENAMES: Lazy<HashMap<(&'static str, &'static str), (&'static str, &'static str)>> =
    Lazy::new(|| {
        HashMap::from([
            (("__builtin__", "object"), ("builtins", "object")),
            (("__builtin__", "long"), ("builtins", "int")),
            (("__builtin__", "unicode"), ("builtins", "str")),
            (("__builtin__", "xrange"), ("builtins", "range")),
            (("__builtin__", "basestring"), ("builtins", "str")),
            (("cPickle", "Unpickler"), ("pickle", "Unpickler")),
            (("cPickle", "Pickler"), ("pickle", "Pickler")),
            (("copy_reg", "_reconstructor"), ("copyreg", "_reconstructor")),
            (("copy_reg", "__newobj__"), ("copyreg", "__newobj__")),
            (
                ("UserDict", "IterableUserDict"),
                ("collections", "UserDict"),
            ),
            (("UserDict", "UserDict"), ("collections", "UserDict")),
            (("UserList", "UserList"), ("collections", "UserList")),
            (("UserString", "UserString"), ("collections", "UserString")),
            (("Queue", "Queue"), ("queue", "Queue")),
            (("Queue", "Empty"), ("queue", "Empty")),
            (("Queue", "Full"), ("queue", "Full")),
            (("Tkinter", "Tk"), ("tkinter", "Tk")),
            (("StringIO", "StringIO"), ("io", "StringIO")),
            (("cStringIO", "StringIO"), ("io", "StringIO")),
            (("itertools", "izip"), ("builtins", "zip")),
            (("itertools", "imap"), ("builtins", "map")),
            (("itertools", "ifilter"), ("builtins", "filter")),
            (
                ("exceptions", "StandardError"),
                ("builtins", "Exception"),
            ),
            (("exceptions", "Exception"), ("builtins", "Exception")),
            (("exceptions", "ValueError"), ("builtins", "ValueError")),
            (("exceptions", "KeyError"), ("builtins", "KeyError")),
            (("exceptions", "IOError"), ("builtins", "OSError")),
            (("exceptions", "OSError"), ("builtins", "OSError")),
            (
                ("exceptions", "AttributeError"),
                ("builtins", "AttributeError"),
            ),
            (
                ("_socket", "error"),
                ("builtins", "OSError"),
            ),
        ])
    });

/// Maps a `(module, name)` pair through the rename table when `proto < 3`.
/// Pairs with no known rename pass through unchanged, matching
/// `compat_pickle`'s behavior of leaving anything it doesn't recognize
/// alone rather than failing.
pub fn rename(proto: u8, module: &str, name: &str) -> (String, String) {
    if proto >= 3 {
        return (module.to_string(), name.to_string());
    }
    match RENAMES.get(&(module, name)) {
        Some((m, n)) => (m.to_string(), n.to_string()),
        None => (module.to_string(), name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renames_known_pairs_under_protocol_3() {
        assert_eq!(
            rename(2, "__builtin__", "long"),
            ("builtins".to_string(), "int".to_string())
        );
        assert_eq!(
            rename(0, "copy_reg", "_reconstructor"),
            ("copyreg".to_string(), "_reconstructor".to_string())
        );
    }

    #[test]
    fn unknown_pairs_pass_through() {
        assert_eq!(
            rename(1, "my_module", "MyClass"),
            ("my_module".to_string(), "MyClass".to_string())
        );
    }

    #[test]
    fn protocol_3_and_above_is_not_rewritten() {
        assert_eq!(
            rename(4, "__builtin__", "long"),
            ("__builtin__".to_string(), "long".to_string())
        );
    }
}

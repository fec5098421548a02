// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.

//! Encoding and decoding for Python's pickle format
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! This crate writes pickle protocol 2 (compatible with Python 2 and 3) and
//! reads the protocol-2 subset it writes, plus the protocol 0/1 literal
//! opcodes and a number of protocol 3/4 forms found in real streams.
//!
//! # Supported types
//!
//! The value model covers Python's built-in types:
//!
//! * None
//! * Booleans (Rust `bool`)
//! * Integers (Rust `i64` or bigints from num)
//! * Floats (Rust `f64`)
//! * Bytes objects and bytearrays (Rust `Vec<u8>`)
//! * (Unicode) strings (Rust `String`)
//! * Lists and tuples (Rust `Vec<Value>`)
//! * Sets and frozensets (Rust `BTreeSet<HashableValue>`)
//! * Dictionaries (Rust `BTreeMap<HashableValue, Value>`)
//!
//! plus three extensions:
//!
//! * `Value::Global` — a reference to a class (or other module-level
//!   callable), as pushed by the GLOBAL opcode
//! * `Value::Ref` — a back-reference into the memo table, expressing shared
//!   and cyclic data
//! * `Value::Object` — an instance of a type implementing the [`Object`]
//!   trait, which is how non-builtin types live in a value graph
//!
//! Out of the box, `datetime.datetime`/`date`/`time`/`timedelta` map to
//! chrono's naive types and `Duration`, `complex` to `num_complex::Complex64`,
//! `decimal.Decimal` to `f64`, and `pytz` timezones to an opaque [`Timezone`].
//! Instances of unknown classes constructed without arguments decode into
//! [`ClassDict`] placeholders.
//!
//! # Extension points
//!
//! The `registry` module holds process-wide registries consulted during
//! encoding and decoding:
//!
//! * [`register_constructor`] maps a `(module, name)` class pair to a
//!   constructor building a value from the REDUCE/NEWOBJ argument tuple.
//! * [`register_deconstructor`] breaks a concrete object type into a class
//!   pair and argument list on encoding.
//! * [`register_pickler`] takes full control of an object type's encoding,
//!   writing opcodes through the [`Emitter`] surface.
//!
//! Per-call hooks for persistent references are configured via
//! [`SerOptions::persistent_id`] and [`DeOptions::persistent_load`].
//!
//! # Unsupported features
//!
//! - The `INST`/`OBJ` and `EXT` opcodes.
//! - Out-of-band data as introduced in Pickle protocol 5.

pub use self::ser::{
    Pickler,
    SerOptions,
    MemoMode,
    Emitter,
    value_to_writer,
    value_to_vec,
};

pub use self::de::{
    Unpickler,
    DeOptions,
    value_from_reader,
    value_from_slice,
    value_from_iter,
};

pub use self::value::{
    Value,
    HashableValue,
};

pub use self::objects::{Object, ClassDict, Timezone};

pub use self::registry::{
    ObjectConstructor,
    ObjectDeconstructor,
    ObjectPickler,
    register_constructor,
    register_deconstructor,
    register_pickler,
};

pub use self::error::{Error, ErrorCode, Result};

pub mod ser;
pub mod de;
pub mod error;
pub mod value;
pub mod objects;
pub mod registry;
mod consts;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;

// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle encoding (protocol 2)

use std::io;
use std::collections::{BTreeMap, BTreeSet};
use byteorder::{LittleEndian, BigEndian, WriteBytesExt};
use num_bigint::BigInt;
use num_traits::Signed;

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::objects::Object;
use crate::registry;
use crate::value::{Value, HashableValue};

/// Hook mapping values to persistent ids (see `SerOptions::persistent_id`).
pub type PersistentIdFn = Box<dyn Fn(&Value) -> Option<Value>>;

/// How the memo assigns ids to values during encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoMode {
    /// Every memoized value gets a fresh id; sharing is only expressed
    /// through explicit `Value::Ref`s.  The default.
    Identity,
    /// Equal hashable values collapse to a single id and are written once.
    ByValue,
    /// No memo opcodes at all.  Encoding a `Value::Ref` fails.
    Disabled,
}

/// Options for encoding.
pub struct SerOptions {
    memo: MemoMode,
    persistent_id: Option<PersistentIdFn>,
}

impl Default for SerOptions {
    fn default() -> Self {
        SerOptions { memo: MemoMode::Identity, persistent_id: None }
    }
}

impl SerOptions {
    pub fn new() -> Self { Self::default() }

    /// Collapse equal hashable values into a single memo entry.
    pub fn by_value_memo(mut self) -> Self {
        self.memo = MemoMode::ByValue;
        self
    }

    /// Emit no memo opcodes.  Self-referential values then fail to encode
    /// with `ErrorCode::Recursive` instead of producing an unreadable
    /// stream.
    pub fn without_memo(mut self) -> Self {
        self.memo = MemoMode::Disabled;
        self
    }

    /// Install a persistent-id hook.  Any value the hook maps to `Some(pid)`
    /// is replaced in the stream by a persistent reference to `pid`; the
    /// decoding side resolves it with its persistent-load hook.
    pub fn persistent_id<F>(mut self, hook: F) -> Self
        where F: Fn(&Value) -> Option<Value> + 'static
    {
        self.persistent_id = Some(Box::new(hook));
        self
    }
}

/// The object-safe encoding surface handed to custom picklers.
///
/// `Pickler` implements it; custom picklers can recurse into `save` for
/// sub-values that the built-in dispatch already handles.
pub trait Emitter {
    /// Encode a complete sub-value, with memoization.
    fn save(&mut self, value: &Value) -> Result<()>;
    /// Write a single opcode byte.
    fn emit_opcode(&mut self, opcode: u8) -> Result<()>;
    /// Write raw bytes (opcode arguments).
    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    /// Write a GLOBAL opcode with the given class reference.
    fn emit_global(&mut self, module: &str, name: &str) -> Result<()>;
}

/// A structure for encoding values into a pickle stream.
pub struct Pickler<W> {
    writer: W,
    memo_mode: MemoMode,
    memo_count: u32,
    memo_table: BTreeMap<HashableValue, u32>,
    persistent_id: Option<PersistentIdFn>,
}

impl<W: io::Write> Pickler<W> {
    pub fn new(writer: W, options: SerOptions) -> Self {
        Pickler {
            writer,
            memo_mode: options.memo,
            memo_count: 0,
            memo_table: BTreeMap::new(),
            persistent_id: options.persistent_id,
        }
    }

    /// Unwrap the `Writer` from the `Pickler`.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Encode one complete value, with protocol header and STOP opcode.
    /// The memo is fresh for every dump.
    pub fn dump(&mut self, value: &Value) -> Result<()> {
        self.memo_count = 0;
        self.memo_table.clear();
        self.writer.write_all(&[PROTO, 2])?;
        self.save_value(value)?;
        self.write_opcode(STOP)
    }

    #[inline]
    fn write_opcode(&mut self, opcode: u8) -> Result<()> {
        self.writer.write_all(&[opcode]).map_err(From::from)
    }

    fn save_value(&mut self, value: &Value) -> Result<()> {
        // The hook is held out while the replacement id is written, so a
        // hook that maps its own replacement doesn't loop.
        if self.persistent_id.is_some() {
            let hook = self.persistent_id.take();
            let pid = hook.as_ref().and_then(|hook| hook(value));
            if let Some(pid) = pid {
                let result = self.save_value(&pid)
                    .and_then(|_| self.write_opcode(BINPERSID));
                self.persistent_id = hook;
                return result;
            }
            self.persistent_id = hook;
        }
        if let Some(id) = self.memo_lookup(value) {
            return self.write_get(id);
        }
        self.save_dispatch(value)
    }

    fn save_dispatch(&mut self, value: &Value) -> Result<()> {
        match *value {
            Value::None    => self.write_opcode(NONE),
            Value::Bool(b) => self.write_opcode(if b { NEWTRUE } else { NEWFALSE }),
            Value::I64(i)  => self.save_int(i),
            Value::F64(f)  => self.save_float(f),
            Value::Int(ref i) => {
                self.save_bigint(i)?;
                self.memoize(value)
            }
            Value::String(ref s) => {
                self.save_unicode(s)?;
                self.memoize(value)
            }
            Value::Bytes(ref b) => {
                self.save_bytes(b)?;
                self.memoize(value)
            }
            Value::Tuple(ref t) => {
                self.save_tuple(t, |slf, v| slf.save_value(v))?;
                if t.is_empty() { Ok(()) } else { self.memoize(value) }
            }
            // The mutable containers get their id before member descent, so
            // a Ref to the container itself resolves to a valid id.
            Value::List(ref l) => {
                self.write_opcode(EMPTY_LIST)?;
                self.memoize(value)?;
                for chunk in l.chunks(1000) {
                    self.write_opcode(MARK)?;
                    for item in chunk {
                        self.save_value(item)?;
                    }
                    self.write_opcode(APPENDS)?;
                }
                Ok(())
            }
            Value::Dict(ref d) => {
                self.write_opcode(EMPTY_DICT)?;
                self.memoize(value)?;
                if !d.is_empty() {
                    self.write_opcode(MARK)?;
                    for (n, (key, item)) in d.iter().enumerate() {
                        if n % 1000 == 999 {
                            self.write_opcode(SETITEMS)?;
                            self.write_opcode(MARK)?;
                        }
                        self.save_hashable(key)?;
                        self.save_value(item)?;
                    }
                    self.write_opcode(SETITEMS)?;
                }
                Ok(())
            }
            Value::Set(ref s) => {
                self.write_opcode(EMPTY_SET)?;
                self.memoize(value)?;
                if !s.is_empty() {
                    self.write_opcode(MARK)?;
                    for (n, item) in s.iter().enumerate() {
                        if n % 1000 == 999 {
                            self.write_opcode(ADDITEMS)?;
                            self.write_opcode(MARK)?;
                        }
                        self.save_hashable(item)?;
                    }
                    self.write_opcode(ADDITEMS)?;
                }
                Ok(())
            }
            Value::FrozenSet(ref s) => {
                self.save_frozenset(s, |slf, v| slf.save_hashable(v))?;
                self.memoize(value)
            }
            Value::Global(ref module, ref name) => {
                self.write_global(module, name)?;
                self.memoize(value)
            }
            Value::Ref(id) => self.save_ref(id),
            Value::Object(ref obj) => {
                let tid = obj.as_any().type_id();
                if let Some(pickler) = registry::find_pickler(tid) {
                    pickler.pickle(obj.as_ref(), self)?;
                    self.memoize(value)
                } else if let Some(deconstructor) = registry::find_deconstructor(tid) {
                    self.write_global(deconstructor.module(), deconstructor.name())?;
                    let args = deconstructor.deconstruct(obj.as_ref())?;
                    self.save_tuple(&args, |slf, v| slf.save_value(v))?;
                    self.write_opcode(REDUCE)?;
                    self.memoize(value)
                } else if let Some(attrs) = obj.attributes() {
                    self.save_attribute_dict(obj.as_ref(), attrs, value)
                } else {
                    Err(Error::Syntax(ErrorCode::UnsupportedType(obj.type_name())))
                }
            }
        }
    }

    fn save_hashable(&mut self, value: &HashableValue) -> Result<()> {
        if let Some(id) = self.memo_lookup_hashable(value) {
            return self.write_get(id);
        }
        match *value {
            HashableValue::None    => self.write_opcode(NONE),
            HashableValue::Bool(b) => self.write_opcode(if b { NEWTRUE } else { NEWFALSE }),
            HashableValue::I64(i)  => self.save_int(i),
            HashableValue::F64(f)  => self.save_float(f),
            HashableValue::Int(ref i) => {
                self.save_bigint(i)?;
                self.memoize_hashable(value)
            }
            HashableValue::String(ref s) => {
                self.save_unicode(s)?;
                self.memoize_hashable(value)
            }
            HashableValue::Bytes(ref b) => {
                self.save_bytes(b)?;
                self.memoize_hashable(value)
            }
            HashableValue::Tuple(ref t) => {
                self.save_tuple(t, |slf, v| slf.save_hashable(v))?;
                if t.is_empty() { Ok(()) } else { self.memoize_hashable(value) }
            }
            HashableValue::FrozenSet(ref s) => {
                self.save_frozenset(s, |slf, v| slf.save_hashable(v))?;
                self.memoize_hashable(value)
            }
        }
    }

    /// Write the narrowest opcode that represents the integer exactly.
    fn save_int(&mut self, value: i64) -> Result<()> {
        if 0 <= value && value < 256 {
            self.write_opcode(BININT1)?;
            self.writer.write_u8(value as u8).map_err(From::from)
        } else if 256 <= value && value < 65536 {
            self.write_opcode(BININT2)?;
            self.writer.write_u16::<LittleEndian>(value as u16).map_err(From::from)
        } else if -0x8000_0000 <= value && value < 0x8000_0000 {
            self.write_opcode(BININT)?;
            self.writer.write_i32::<LittleEndian>(value as i32).map_err(From::from)
        } else {
            // Same minimal two's-complement run a bigint would get.
            let bytes = value.to_le_bytes();
            let mut len = bytes.len();
            while len > 1 {
                let sign_ext = if bytes[len - 2] & 0x80 != 0 { 0xff } else { 0x00 };
                if bytes[len - 1] != sign_ext {
                    break;
                }
                len -= 1;
            }
            self.write_opcode(LONG1)?;
            self.writer.write_u8(len as u8)?;
            self.writer.write_all(&bytes[..len]).map_err(From::from)
        }
    }

    fn save_float(&mut self, value: f64) -> Result<()> {
        self.write_opcode(BINFLOAT)?;
        // Yes, this one is big endian.
        self.writer.write_f64::<BigEndian>(value).map_err(From::from)
    }

    fn save_unicode(&mut self, value: &str) -> Result<()> {
        self.write_opcode(BINUNICODE)?;
        self.writer.write_u32::<LittleEndian>(value.len() as u32)?;
        self.writer.write_all(value.as_bytes()).map_err(From::from)
    }

    // Byte strings are represented as bytearray(text, "latin-1") calls,
    // which decode to bytes objects in both Python 2 and Python 3.
    fn save_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_global("__builtin__", "bytearray")?;
        let text: String = value.iter().map(|&b| b as char).collect();
        self.save_unicode(&text)?;
        self.save_unicode("latin-1")?;
        self.write_opcode(TUPLE2)?;
        self.write_opcode(REDUCE)
    }

    fn save_bigint(&mut self, i: &BigInt) -> Result<()> {
        let bytes = if i.is_negative() {
            let n_bytes = i.to_bytes_le().1.len();
            let pos = i + (BigInt::from(1) << (n_bytes * 8));
            let mut bytes = pos.to_bytes_le().1;
            while bytes.len() < n_bytes {
                bytes.push(0x00);
            }
            if bytes.last().unwrap() < &0x80 {
                bytes.push(0xff);
            }
            bytes
        } else {
            let mut bytes = i.to_bytes_le().1;
            if bytes.last().unwrap() >= &0x80 {
                bytes.push(0x00);
            }
            bytes
        };
        if bytes.len() < 256 {
            self.write_opcode(LONG1)?;
            self.writer.write_u8(bytes.len() as u8)?;
        } else {
            self.write_opcode(LONG4)?;
            self.writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
        }
        self.writer.write_all(&bytes).map_err(From::from)
    }

    fn save_tuple<T, F>(&mut self, t: &[T], f: F) -> Result<()>
        where F: Fn(&mut Self, &T) -> Result<()>
    {
        if t.is_empty() {
            self.write_opcode(EMPTY_TUPLE)
        } else if t.len() == 1 {
            f(self, &t[0])?;
            self.write_opcode(TUPLE1)
        } else if t.len() == 2 {
            f(self, &t[0])?;
            f(self, &t[1])?;
            self.write_opcode(TUPLE2)
        } else if t.len() == 3 {
            f(self, &t[0])?;
            f(self, &t[1])?;
            f(self, &t[2])?;
            self.write_opcode(TUPLE3)
        } else {
            self.write_opcode(MARK)?;
            for item in t.iter() {
                f(self, item)?;
            }
            self.write_opcode(TUPLE)
        }
    }

    fn save_frozenset<F>(&mut self, items: &BTreeSet<HashableValue>, f: F) -> Result<()>
        where F: Fn(&mut Self, &HashableValue) -> Result<()>
    {
        self.write_opcode(MARK)?;
        for item in items.iter() {
            f(self, item)?;
        }
        self.write_opcode(FROZENSET)
    }

    // Fallback for object types that expose their attributes: an attribute
    // dict with the class name under the __class__ key.
    fn save_attribute_dict(&mut self, obj: &dyn Object,
                           attrs: Vec<(String, Value)>, value: &Value) -> Result<()> {
        let class = match obj.class_name() {
            Some(class) => class,
            None => return Err(Error::Syntax(ErrorCode::UnsupportedType(obj.type_name()))),
        };
        self.write_opcode(EMPTY_DICT)?;
        self.memoize(value)?;
        self.write_opcode(MARK)?;
        self.save_unicode("__class__")?;
        self.save_unicode(&class)?;
        for (name, item) in &attrs {
            self.save_unicode(name)?;
            self.save_value(item)?;
        }
        self.write_opcode(SETITEMS)
    }

    fn write_global(&mut self, module: &str, name: &str) -> Result<()> {
        self.write_opcode(GLOBAL)?;
        self.writer.write_all(module.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(name.as_bytes())?;
        self.writer.write_all(b"\n").map_err(From::from)
    }

    fn save_ref(&mut self, id: u32) -> Result<()> {
        if self.memo_mode == MemoMode::Disabled {
            return Err(Error::Syntax(ErrorCode::Recursive));
        }
        if id >= self.memo_count {
            return Err(Error::Syntax(ErrorCode::MissingMemo(id)));
        }
        self.write_get(id)
    }

    fn memo_lookup(&self, value: &Value) -> Option<u32> {
        if self.memo_mode != MemoMode::ByValue {
            return None;
        }
        match *value {
            Value::Int(_) | Value::String(_) | Value::Bytes(_) |
            Value::Tuple(_) | Value::FrozenSet(_) => {
                let key = value.clone().into_hashable().ok()?;
                self.memo_table.get(&key).copied()
            }
            _ => None,
        }
    }

    fn memo_lookup_hashable(&self, value: &HashableValue) -> Option<u32> {
        if self.memo_mode != MemoMode::ByValue {
            return None;
        }
        self.memo_table.get(value).copied()
    }

    fn memoize(&mut self, value: &Value) -> Result<()> {
        if self.memo_mode == MemoMode::Disabled {
            return Ok(());
        }
        let id = self.memo_count;
        self.memo_count += 1;
        if self.memo_mode == MemoMode::ByValue {
            if let Ok(key) = value.clone().into_hashable() {
                self.memo_table.insert(key, id);
            }
        }
        self.write_put(id)
    }

    fn memoize_hashable(&mut self, value: &HashableValue) -> Result<()> {
        if self.memo_mode == MemoMode::Disabled {
            return Ok(());
        }
        let id = self.memo_count;
        self.memo_count += 1;
        if self.memo_mode == MemoMode::ByValue {
            self.memo_table.insert(value.clone(), id);
        }
        self.write_put(id)
    }

    fn write_put(&mut self, id: u32) -> Result<()> {
        if id < 256 {
            self.write_opcode(BINPUT)?;
            self.writer.write_u8(id as u8).map_err(From::from)
        } else {
            self.write_opcode(LONG_BINPUT)?;
            self.writer.write_u32::<LittleEndian>(id).map_err(From::from)
        }
    }

    fn write_get(&mut self, id: u32) -> Result<()> {
        if id < 256 {
            self.write_opcode(BINGET)?;
            self.writer.write_u8(id as u8).map_err(From::from)
        } else {
            self.write_opcode(LONG_BINGET)?;
            self.writer.write_u32::<LittleEndian>(id).map_err(From::from)
        }
    }
}

impl<W: io::Write> Emitter for Pickler<W> {
    fn save(&mut self, value: &Value) -> Result<()> {
        self.save_value(value)
    }

    fn emit_opcode(&mut self, opcode: u8) -> Result<()> {
        self.write_opcode(opcode)
    }

    fn emit_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).map_err(From::from)
    }

    fn emit_global(&mut self, module: &str, name: &str) -> Result<()> {
        self.write_global(module, name)
    }
}

/// Encode the value into a pickle stream.
pub fn value_to_writer<W: io::Write>(writer: &mut W, value: &Value, options: SerOptions)
                                     -> Result<()> {
    let mut pickler = Pickler::new(writer, options);
    pickler.dump(value)
}

/// Encode the value into a `Vec<u8>` buffer.
#[inline]
pub fn value_to_vec(value: &Value, options: SerOptions) -> Result<Vec<u8>> {
    let mut writer = Vec::with_capacity(128);
    value_to_writer(&mut writer, value, options)?;
    Ok(writer)
}
